//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, loads configuration, initializes tracing and the
//! database-backed services, then dispatches to the command handler.

mod cli;
mod state;

use std::time::Duration;

use clap::Parser;
use clap_complete::generate;
use stepwise_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::{AppState, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need config or state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let settings = Settings::load(cli.config.as_deref()).await;
    init_tracing(TracingOptions {
        format: settings.config.log.format,
        verbosity: cli.verbose,
        quiet: cli.quiet,
        otel: settings.config.log.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli, &settings).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, settings: &Settings) -> anyhow::Result<()> {
    // Validation reads the definition file only
    if let Commands::Validate { file } = &cli.command {
        let file = file.clone().unwrap_or_else(|| settings.definitions_file());
        return cli::workflow::validate_file(&file, cli.json).await;
    }

    let state = AppState::init(settings).await?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await?;
        }

        Commands::Run {
            workflow_id,
            input,
            wait,
            timeout,
        } => {
            let input = cli::run::parse_input(input.as_deref())?;
            if wait || timeout.is_some() {
                cli::run::run_and_wait(
                    &state,
                    &workflow_id,
                    input,
                    timeout.map(Duration::from_secs),
                    cli.json,
                )
                .await?;
            } else {
                cli::run::enqueue_run(&state, &workflow_id, input, cli.json).await?;
            }
        }

        Commands::Executions { workflow, limit } => {
            cli::run::list_executions(&state, workflow.as_deref(), limit, cli.json).await?;
        }

        Commands::Execution { execution_id } => {
            cli::run::show_execution(&state, &execution_id, cli.json).await?;
        }

        Commands::Stats => {
            cli::queue::stats(&state, cli.json).await?;
        }

        Commands::Jobs { action } => {
            cli::queue::handle_jobs_command(action, &state, cli.json).await?;
        }

        Commands::Serve => {
            cli::serve::serve(&state, settings, cli.json, cli.quiet).await?;
        }

        Commands::Validate { .. } | Commands::Completions { .. } => {
            unreachable!("handled above")
        }
    }

    Ok(())
}
