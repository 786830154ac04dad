//! CLI workflow definition subcommands.
//!
//! Provides validate, list, show, create, update, enable/disable and delete
//! operations over the definition file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepwise_core::workflow::{DefinitionStore, validate_definition};
use stepwise_infra::definition::JsonFileDefinitionRepository;
use stepwise_types::workflow::{TriggerConfig, ValidationReport, WorkflowDefinition};

use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// List stored workflows.
    #[command(alias = "ls")]
    List,

    /// Show one workflow with its steps and triggers.
    Show {
        /// Workflow id.
        id: String,
    },

    /// Store a new workflow from a JSON file.
    Create {
        /// Path to a JSON workflow definition.
        file: PathBuf,
    },

    /// Replace an existing workflow from a JSON file.
    Update {
        /// Path to a JSON workflow definition.
        file: PathBuf,
    },

    /// Enable a workflow (arms its triggers on the next serve sync).
    Enable {
        /// Workflow id.
        id: String,
    },

    /// Disable a workflow.
    Disable {
        /// Workflow id.
        id: String,
    },

    /// Delete a workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow id.
        id: String,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { id } => handle_show(&id, state, json).await,
        WorkflowCommand::Create { file } => handle_create(&file, state, json).await,
        WorkflowCommand::Update { file } => handle_update(&file, state, json).await,
        WorkflowCommand::Enable { id } => handle_set_enabled(&id, true, state, json).await,
        WorkflowCommand::Disable { id } => handle_set_enabled(&id, false, state, json).await,
        WorkflowCommand::Delete { id } => handle_delete(&id, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Validate every workflow in `file`. Fails when any workflow has errors.
pub async fn validate_file(file: &Path, json: bool) -> Result<()> {
    if !tokio::fs::try_exists(file).await.unwrap_or(false) {
        bail!("Definition file {} not found", file.display());
    }
    let store = DefinitionStore::new(JsonFileDefinitionRepository::new(file));
    let workflows = store
        .load()
        .await
        .with_context(|| format!("Failed to load {}", file.display()))?;

    let reports: Vec<(String, ValidationReport)> = workflows
        .iter()
        .map(|w| (w.id.clone(), store.validate(w)))
        .collect();
    let invalid = reports.iter().filter(|(_, r)| !r.valid).count();

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|(id, r)| {
                serde_json::json!({
                    "id": id,
                    "valid": r.valid,
                    "errors": r.errors,
                    "warnings": r.warnings,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  {}", style(file.display()).dim());
        println!();
        if reports.is_empty() {
            println!("  No workflows defined.");
        }
        for (id, report) in &reports {
            print_report(id, report);
        }
        println!();
    }

    if invalid > 0 {
        bail!("{invalid} of {} workflows failed validation", reports.len());
    }
    Ok(())
}

fn print_report(id: &str, report: &ValidationReport) {
    let mark = if report.valid {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!("  {} {}", mark, style(id).cyan());
    for error in &report.errors {
        println!("      {} {}", style("error:").red(), error);
    }
    for warning in &report.warnings {
        println!("      {} {}", style("warning:").yellow(), warning);
    }
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state
        .engine
        .list_workflows()
        .await
        .context("Failed to list workflows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!(
            "  Create one with: {}",
            style("stepwise workflow create <file.json>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Triggers"),
            Cell::new("Enabled"),
        ]);

    for w in &workflows {
        let enabled = if w.enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(&w.id),
            Cell::new(&w.name),
            Cell::new(w.steps.len()),
            Cell::new(trigger_summary(w)),
            enabled,
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Comma-separated trigger kinds, with the top-level schedule first.
fn trigger_summary(workflow: &WorkflowDefinition) -> String {
    let mut kinds: Vec<&str> = Vec::new();
    if workflow.schedule.is_some() {
        kinds.push("schedule");
    }
    for trigger in &workflow.triggers {
        let kind = match trigger {
            TriggerConfig::Manual {} => "manual",
            TriggerConfig::FileWatch { .. } => "file-watch",
            TriggerConfig::Schedule { .. } => "schedule",
        };
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        "-".to_string()
    } else {
        kinds.join(", ")
    }
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let workflow = state
        .engine
        .get_workflow(id)
        .await
        .context("Failed to load workflow")?
        .with_context(|| format!("Workflow '{id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} ({})",
        style(&workflow.name).cyan().bold(),
        style(&workflow.id).dim()
    );
    if let Some(description) = &workflow.description {
        println!("  {description}");
    }
    println!();
    println!("  Enabled: {}", if workflow.enabled { "yes" } else { "no" });
    println!("  On step failure: {:?}", workflow.on_step_failure);
    if let Some(schedule) = workflow.effective_schedule() {
        println!(
            "  Schedule: {}{}",
            schedule.cron_expression,
            schedule
                .timezone
                .map(|tz| format!(" ({tz})"))
                .unwrap_or_default()
        );
    }
    for trigger in &workflow.triggers {
        if let TriggerConfig::FileWatch { path, pattern, .. } = trigger {
            println!(
                "  Watches: {}{}",
                path,
                pattern
                    .as_deref()
                    .map(|p| format!(" matching {p}"))
                    .unwrap_or_default()
            );
        }
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Queue"),
            Cell::new("Depends on"),
        ]);
    for step in &workflow.steps {
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(step.step_type),
            Cell::new(step.queue()),
            Cell::new(if step.dependencies.is_empty() {
                "-".to_string()
            } else {
                step.dependencies.join(", ")
            }),
        ]);
    }
    println!("{table}");

    let report = validate_definition(&workflow);
    if !report.warnings.is_empty() {
        println!();
        for warning in &report.warnings {
            println!("  {} {}", style("warning:").yellow(), warning);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Create / update / enable / delete
// ---------------------------------------------------------------------------

async fn read_definition(file: &Path) -> Result<WorkflowDefinition> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse workflow definition in {}", file.display()))
}

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = read_definition(file).await?;
    let created = state.engine.create_workflow(def).await?;
    print_saved("Created", &created, json)
}

async fn handle_update(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = read_definition(file).await?;
    let updated = state.engine.update_workflow(def).await?;
    print_saved("Updated", &updated, json)
}

async fn handle_set_enabled(id: &str, enabled: bool, state: &AppState, json: bool) -> Result<()> {
    let mut def = state
        .engine
        .get_workflow(id)
        .await
        .context("Failed to load workflow")?
        .with_context(|| format!("Workflow '{id}' not found"))?;
    def.enabled = enabled;
    let saved = state.engine.update_workflow(def).await?;
    print_saved(if enabled { "Enabled" } else { "Disabled" }, &saved, json)
}

fn print_saved(verb: &str, def: &WorkflowDefinition, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} workflow '{}'",
        style("*").green().bold(),
        verb,
        style(&def.id).cyan()
    );
    println!("  Steps: {}", def.steps.len());
    println!("  Triggers: {}", trigger_summary(def));
    for warning in validate_definition(def).warnings {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
    println!();
    Ok(())
}

async fn handle_delete(id: &str, state: &AppState, json: bool) -> Result<()> {
    let deleted = state
        .engine
        .delete_workflow(id)
        .await
        .context("Failed to delete workflow")?;
    if !deleted {
        bail!("Workflow '{id}' not found");
    }

    if json {
        println!("{}", serde_json::json!({ "id": id, "deleted": true }));
    } else {
        println!();
        println!(
            "  {} Deleted workflow '{}'",
            style("*").green().bold(),
            style(id).cyan()
        );
        println!();
    }
    Ok(())
}
