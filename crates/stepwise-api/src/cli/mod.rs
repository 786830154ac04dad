//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Every command honours the
//! global `--json` flag for machine-readable output.

pub mod queue;
pub mod run;
pub mod serve;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run workflows of queued steps on schedules, file arrivals, or demand.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path of stepwise.toml (default: <data dir>/stepwise.toml).
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every workflow in a definition file.
    Validate {
        /// Definition file (default: the configured one).
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start a workflow execution.
    Run {
        /// Workflow id.
        workflow_id: String,

        /// JSON input handed to every step.
        #[arg(long)]
        input: Option<String>,

        /// Run in this process and wait for the result.
        #[arg(long)]
        wait: bool,

        /// Give up (and cancel the execution) after this many seconds. Implies --wait.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List recent executions.
    Executions {
        /// Only executions of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one execution with its step states and log.
    Execution {
        /// Execution UUID.
        execution_id: String,
    },

    /// Queue statistics and system metrics.
    Stats,

    /// Inspect and maintain queued jobs.
    Jobs {
        #[command(subcommand)]
        action: queue::JobsCommand,
    },

    /// Run queue workers, schedules, and file watchers until interrupted.
    Serve,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
