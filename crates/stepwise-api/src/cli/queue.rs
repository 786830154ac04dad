//! CLI queue subcommands: statistics, job inspection, retry, and cleanup.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepwise_types::job::{JobState, QueueName};

use crate::state::AppState;

/// Job maintenance subcommands.
#[derive(Subcommand)]
pub enum JobsCommand {
    /// Show one job.
    Show {
        /// Job id.
        job_id: String,
    },

    /// Move a failed job back to waiting with a fresh attempt budget.
    Retry {
        /// Job id.
        job_id: String,
    },

    /// Delete finished jobs from a queue.
    Clean {
        /// Queue name (e.g. document-processing).
        queue: String,

        /// Terminal state to remove: completed or failed.
        #[arg(long, default_value = "completed")]
        state: String,

        /// Only jobs that finished at least this many seconds ago.
        #[arg(long, default_value = "0")]
        older_than_secs: u64,
    },
}

pub async fn handle_jobs_command(cmd: JobsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        JobsCommand::Show { job_id } => handle_show(&job_id, state, json).await,
        JobsCommand::Retry { job_id } => handle_retry(&job_id, state, json).await,
        JobsCommand::Clean {
            queue,
            state: job_state,
            older_than_secs,
        } => handle_clean(&queue, &job_state, older_than_secs, state, json).await,
    }
}

fn parse_queue(raw: &str) -> Result<QueueName> {
    raw.parse::<QueueName>().map_err(|e| anyhow!(e))
}

fn parse_terminal_state(raw: &str) -> Result<JobState> {
    let parsed = raw.parse::<JobState>().map_err(|e| anyhow!(e))?;
    if !parsed.is_terminal() {
        bail!("Only completed or failed jobs can be cleaned, not '{raw}'");
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Queue statistics plus workflow metrics.
pub async fn stats(state: &AppState, json: bool) -> Result<()> {
    let queues = state
        .queue
        .get_system_stats()
        .await
        .context("Failed to read queue statistics")?;
    let metrics = state
        .engine
        .get_system_metrics()
        .await
        .context("Failed to compute workflow metrics")?;

    if json {
        let out = serde_json::json!({ "queues": queues, "metrics": metrics });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Waiting"),
            Cell::new("Delayed"),
            Cell::new("Active"),
            Cell::new("Completed"),
            Cell::new("Failed"),
            Cell::new("Workers"),
        ]);
    for q in &queues.queues {
        let name = if q.paused {
            Cell::new(format!("{} (paused)", q.queue)).fg(Color::Yellow)
        } else {
            Cell::new(q.queue)
        };
        let failed = if q.failed > 0 {
            Cell::new(q.failed).fg(Color::Red)
        } else {
            Cell::new(q.failed)
        };
        table.add_row(vec![
            name,
            Cell::new(q.waiting),
            Cell::new(q.delayed),
            Cell::new(q.active),
            Cell::new(q.completed),
            failed,
            Cell::new(q.concurrency),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  Workflows: {} ({} enabled)",
        metrics.workflows, metrics.enabled_workflows
    );
    println!(
        "  Executions: {} total, {} active, {} completed, {} failed, {} cancelled",
        metrics.executions,
        metrics.active_executions,
        metrics.completed,
        metrics.failed,
        metrics.cancelled
    );
    println!(
        "  Success rate: {:.1}%  Average duration: {:.0}ms",
        metrics.success_rate * 100.0,
        metrics.average_duration_ms
    );
    let health = if queues.healthy {
        style("healthy").green()
    } else {
        style("unhealthy").red()
    };
    println!("  Queue store: {health}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn handle_show(job_id: &str, state: &AppState, json: bool) -> Result<()> {
    let job = state
        .queue
        .get_job(job_id)
        .await
        .context("Failed to load job")?
        .with_context(|| format!("Job '{job_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style(&job.job_type).cyan().bold(), style(&job.id).dim());
    println!("  Queue: {}", job.queue);
    println!("  State: {}", job.state);
    println!("  Priority: {:?}", job.priority);
    println!("  Attempts: {}/{}", job.attempts_made, job.max_attempts);
    println!("  Progress: {}%", job.progress);
    if let Some(reason) = &job.failed_reason {
        println!("  Failed: {}", style(reason).red());
    }
    if let Some(result) = &job.result {
        println!("  Result: {result}");
    }
    println!();
    Ok(())
}

async fn handle_retry(job_id: &str, state: &AppState, json: bool) -> Result<()> {
    let retried = state
        .queue
        .retry_job(job_id)
        .await
        .context("Failed to retry job")?;
    if !retried {
        bail!("Job '{job_id}' is unknown or not failed");
    }

    if json {
        println!("{}", serde_json::json!({ "job_id": job_id, "retried": true }));
    } else {
        println!();
        println!(
            "  {} Job {} re-queued",
            style("*").green().bold(),
            style(job_id).cyan()
        );
        println!();
    }
    Ok(())
}

async fn handle_clean(
    queue: &str,
    job_state: &str,
    older_than_secs: u64,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let queue = parse_queue(queue)?;
    let job_state = parse_terminal_state(job_state)?;
    let removed = state
        .queue
        .clean_queue(queue, Duration::from_secs(older_than_secs), job_state)
        .await
        .context("Failed to clean queue")?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "queue": queue, "state": job_state, "removed": removed })
        );
    } else {
        println!();
        println!(
            "  {} Removed {} {} job(s) from {}",
            style("*").green().bold(),
            removed,
            job_state,
            style(queue).cyan()
        );
        println!();
    }
    Ok(())
}
