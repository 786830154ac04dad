//! CLI execution subcommands: start a workflow, list executions, and show one
//! execution in detail.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use stepwise_core::processor::builtin::{EXECUTE_WORKFLOW_JOB, ExecuteWorkflowPayload};
use stepwise_core::workflow::ExecuteOptions;
use stepwise_types::execution::{ExecutionStatus, LogLevel, StepStatus, WorkflowExecution};
use stepwise_types::job::{JobData, QueueName};

use crate::state::AppState;

/// Parse `--input`, defaulting to an empty object.
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(Value::Object(Default::default())),
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON input"),
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run a workflow in this process and wait for it to finish.
pub async fn run_and_wait(
    state: &AppState,
    workflow_id: &str,
    input: Value,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()> {
    state.start_processing().await?;
    let outcome = state
        .engine
        .execute_workflow(
            workflow_id,
            input,
            ExecuteOptions {
                timeout,
                ..ExecuteOptions::default()
            },
        )
        .await;
    state.shutdown().await;
    let result = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!(
            "  {} Execution {} {}",
            status_mark(result.status),
            style(result.execution_id).dim(),
            status_label(result.status)
        );
        println!("  Duration: {}ms", result.duration_ms);
        if let Some(error) = &result.error {
            println!("  Error: {}", style(error).red());
        }
        for (step, output) in &result.results {
            println!("  {} {}", style(step).cyan(), output);
        }
        println!();
    }

    if result.status != ExecutionStatus::Completed {
        bail!(
            "Workflow '{workflow_id}' finished {}",
            result.status.as_str()
        );
    }
    Ok(())
}

/// Hand the start to a running `stepwise serve` by enqueueing an
/// `execute-workflow` job.
pub async fn enqueue_run(
    state: &AppState,
    workflow_id: &str,
    input: Value,
    json: bool,
) -> Result<()> {
    let workflow = state
        .engine
        .get_workflow(workflow_id)
        .await
        .context("Failed to load workflow")?
        .with_context(|| format!("Workflow '{workflow_id}' not found"))?;
    if !workflow.enabled {
        bail!("Workflow '{workflow_id}' is disabled");
    }

    let payload = serde_json::to_value(ExecuteWorkflowPayload {
        workflow_id: workflow_id.to_string(),
        input,
    })?;
    let job_id = state
        .queue
        .add_job(
            QueueName::WorkflowExecution,
            JobData::new(EXECUTE_WORKFLOW_JOB, payload),
            None,
        )
        .await
        .context("Failed to enqueue workflow start")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "workflow_id": workflow_id,
                "job_id": job_id,
                "queue": QueueName::WorkflowExecution,
            }))?
        );
    } else {
        println!();
        println!(
            "  {} Queued workflow '{}'",
            style("*").green().bold(),
            style(workflow_id).cyan()
        );
        println!("  Job ID: {job_id}");
        println!(
            "  A running {} picks it up; check with {}",
            style("stepwise serve").dim(),
            style(format!("stepwise executions --workflow {workflow_id}")).dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

pub async fn list_executions(
    state: &AppState,
    workflow_id: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let executions = state
        .engine
        .list_executions(workflow_id, limit)
        .await
        .context("Failed to list executions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Trigger"),
            Cell::new("Started"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.execution_id),
            Cell::new(&e.workflow_id),
            Cell::new(e.status.as_str()).fg(status_color(e.status)),
            Cell::new(format!("{}%", e.progress)),
            Cell::new(e.trigger.to_string()),
            Cell::new(e.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
    Ok(())
}

pub async fn show_execution(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let id = Uuid::parse_str(execution_id)
        .with_context(|| format!("'{execution_id}' is not an execution UUID"))?;
    let execution = state
        .engine
        .get_execution(id)
        .await
        .context("Failed to load execution")?
        .with_context(|| format!("Execution {id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    print_execution(&execution);
    Ok(())
}

fn print_execution(execution: &WorkflowExecution) {
    println!();
    println!(
        "  {} {} {}",
        status_mark(execution.status),
        style(&execution.workflow_id).cyan().bold(),
        style(execution.execution_id).dim()
    );
    println!(
        "  Status: {} ({}%)",
        status_label(execution.status),
        execution.progress
    );
    println!("  Trigger: {}", execution.trigger);
    if let Some(original) = execution.retry_of {
        println!("  Retry of: {original}");
    }
    if let Some(error) = &execution.error {
        println!("  Error: {}", style(error).red());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Error"),
        ]);
    for (id, step) in &execution.steps {
        let color = match step.status {
            StepStatus::Completed => Color::Green,
            StepStatus::Failed => Color::Red,
            StepStatus::Skipped => Color::DarkGrey,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(id),
            Cell::new(format!("{:?}", step.status).to_lowercase()).fg(color),
            Cell::new(step.attempts),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");

    if !execution.logs.is_empty() {
        println!();
        for entry in &execution.logs {
            let level = match entry.level {
                LogLevel::Error => style("ERROR").red(),
                LogLevel::Warn => style("WARN ").yellow(),
                LogLevel::Info => style("INFO ").green(),
            };
            println!(
                "  {} {} {}",
                style(entry.timestamp.format("%H:%M:%S%.3f")).dim(),
                level,
                entry.message
            );
        }
    }
    println!();
}

fn status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
        ExecutionStatus::Paused => Color::Yellow,
        ExecutionStatus::Pending | ExecutionStatus::Running => Color::Blue,
    }
}

fn status_mark(status: ExecutionStatus) -> console::StyledObject<&'static str> {
    match status {
        ExecutionStatus::Completed => style("✓").green(),
        ExecutionStatus::Failed => style("✗").red(),
        ExecutionStatus::Cancelled => style("-").dim(),
        _ => style("…").yellow(),
    }
}

fn status_label(status: ExecutionStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        ExecutionStatus::Completed => style(label).green(),
        ExecutionStatus::Failed => style(label).red(),
        _ => style(label).yellow(),
    }
}
