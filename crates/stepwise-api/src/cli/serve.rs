//! `stepwise serve`: run queue workers, schedules, and file watchers until
//! Ctrl-C or SIGTERM, then shut down gracefully.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;
use stepwise_infra::trigger::TriggerSupervisor;
use tokio_util::sync::CancellationToken;

use crate::state::{AppState, ConcreteEngine, Settings};

pub async fn serve(state: &AppState, settings: &Settings, json: bool, quiet: bool) -> Result<()> {
    state.start_processing().await?;
    let cancel = CancellationToken::new();
    let supervisor = state.start_triggers(cancel.clone()).await?;
    let reload = tokio::spawn(reload_definitions(
        state.engine.clone(),
        state.supervisor.clone(),
        Duration::from_millis(state.config.health_check_interval_ms),
        cancel.clone(),
    ));

    let announce = !json && !quiet;
    let _complete = state.engine.on_workflow_complete(move |e| {
        if announce {
            println!(
                "  {} {} {}",
                style("✓").green(),
                style(&e.workflow_id).cyan(),
                style(e.execution_id).dim()
            );
        }
    });
    let _failed = state.engine.on_workflow_error(move |e| {
        if announce {
            println!(
                "  {} {} {} {}",
                style("✗").red(),
                style(&e.workflow_id).cyan(),
                style(e.execution_id).dim(),
                e.error.as_deref().unwrap_or("")
            );
        }
    });
    let _watch_errors = state.watchers.on_watcher_error(move |e| {
        if announce {
            println!(
                "  {} watcher for '{}' stopped: {}",
                style("!").yellow(),
                e.workflow_id,
                e.error
            );
        }
    });

    if json {
        let out = serde_json::json!({
            "status": "running",
            "config": settings.config_path,
            "definitions": settings.definitions_file(),
            "schedules": state.scheduler.list_scheduled_workflows(),
            "watchers": state.watchers.list_file_watchers(),
        });
        println!("{out}");
    } else if !quiet {
        println!();
        println!(
            "  {} Stepwise running ({} schedule(s), {} watcher(s))",
            style("⚡").bold(),
            state.scheduler.list_scheduled_workflows().len(),
            state.watchers.list_file_watchers().len()
        );
        println!("  Definitions: {}", style(settings.definitions_file().display()).dim());
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    shutdown_signal().await;

    cancel.cancel();
    let _ = supervisor.await;
    let _ = reload.await;
    state.shutdown().await;

    if !json && !quiet {
        println!("\n  Stopped.");
    }
    Ok(())
}

/// Re-sync triggers when the definition file is edited by another process.
async fn reload_definitions(
    engine: Arc<ConcreteEngine>,
    supervisor: Arc<TriggerSupervisor>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut known = engine.list_workflows().await.unwrap_or_default();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = match engine.list_workflows().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload workflow definitions");
                continue;
            }
        };
        if current == known {
            continue;
        }
        for gone in known.iter().filter(|k| !current.iter().any(|c| c.id == k.id)) {
            supervisor.remove_workflow(&gone.id);
        }
        for workflow in current.iter().filter(|c| !known.contains(c)) {
            supervisor.sync_workflow(workflow);
        }
        tracing::info!(workflows = current.len(), "workflow definitions reloaded");
        known = current;
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
