//! Workflow definition validation and the versioned definition store.
//!
//! `validate_definition` collects every structural problem in a definition
//! rather than stopping at the first. `DefinitionStore` parses and writes the
//! JSON definition document through a [`DefinitionRepository`], checking the
//! document version on every load.

use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    CURRENT_DOCUMENT_VERSION, DefinitionDocument, DefinitionSettings, FileOperationKind,
    SUPPORTED_DOCUMENT_VERSIONS, StepConfig, StepDefinition, TriggerConfig, ValidationReport,
    WorkflowDefinition,
};
use thiserror::Error;
use tokio::sync::Mutex;

use super::dag;
use crate::repository::DefinitionRepository;
use crate::trigger::scheduler::validate_schedule;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while reading, writing, or analysing definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The document's `version` is not in the supported allow-list.
    #[error("unsupported definition version '{version}' (supported: {supported})")]
    UnsupportedVersion { version: String, supported: String },

    #[error("failed to parse definition document: {0}")]
    Parse(String),

    #[error("failed to serialize definition document: {0}")]
    Serialize(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("{0}")]
    CycleDetected(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition, returning every violation found.
///
/// Errors make the definition unusable; warnings flag likely mistakes
/// (isolated steps, no way to start the workflow, disabled workflow).
pub fn validate_definition(def: &WorkflowDefinition) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if def.id.trim().is_empty() {
        errors.push("workflow id is required".to_string());
    }
    if def.name.trim().is_empty() {
        errors.push("workflow name is required".to_string());
    }
    if def.steps.is_empty() {
        errors.push("workflow must have at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            errors.push("step id is required".to_string());
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        if step.name.trim().is_empty() {
            errors.push(format!("step '{}' has no name", step.id));
        }
    }

    let mut graph_ok = true;
    for step in &def.steps {
        for dep in &step.dependencies {
            if *dep == step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
                graph_ok = false;
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
        validate_step(step, &mut errors);
    }

    if let Some(cycle) = dag::find_cycle(&def.steps) {
        errors.push(format!("dependency cycle detected: {}", cycle.join(" -> ")));
        graph_ok = false;
    }

    if let Some(schedule) = &def.schedule {
        if let Err(e) = validate_schedule(&schedule.cron_expression, schedule.timezone.as_deref()) {
            errors.push(format!("schedule: {e}"));
        }
    }
    for (i, trigger) in def.triggers.iter().enumerate() {
        validate_trigger(i, trigger, &mut errors);
    }

    if graph_ok && def.steps.len() > 1 {
        for id in dag::isolated_steps(&def.steps) {
            warnings.push(format!(
                "step '{id}' has no dependencies and nothing depends on it"
            ));
        }
    }
    for step in &def.steps {
        let default_queue = step.step_type.default_queue();
        if step.queue() != default_queue {
            warnings.push(format!(
                "step '{}' runs on queue '{}' instead of '{default_queue}'; built-in processors only serve '{default_queue}', so the step will fail unless a '{}' processor is registered on that queue",
                step.id,
                step.queue(),
                step.step_type
            ));
        }
    }
    let has_start = def.schedule.is_some() || !def.triggers.is_empty();
    if !has_start {
        warnings.push("workflow has no triggers or schedule; it can only be run manually".to_string());
    }
    if !def.enabled {
        warnings.push("workflow is disabled and will not run".to_string());
    }

    let mut report = ValidationReport::from_errors(errors);
    report.warnings = warnings;
    report
}

fn validate_step(step: &StepDefinition, errors: &mut Vec<String>) {
    let id = &step.id;
    if step.config.step_type() != step.step_type {
        errors.push(format!(
            "step '{id}' has type '{}' but config type '{}'",
            step.step_type,
            step.config.step_type()
        ));
    }

    match &step.config {
        StepConfig::DocumentAnalysis { source, .. }
        | StepConfig::RequirementExtraction { source, .. } => {
            if source.trim().is_empty() {
                errors.push(format!("step '{id}': source is required"));
            }
        }
        StepConfig::Estimation {
            hourly_rate,
            contingency_percent,
            ..
        } => {
            if hourly_rate.is_some_and(|r| r <= 0.0) {
                errors.push(format!("step '{id}': hourlyRate must be > 0"));
            }
            if contingency_percent.is_some_and(|c| !(0.0..=100.0).contains(&c)) {
                errors.push(format!(
                    "step '{id}': contingencyPercent must be between 0 and 100"
                ));
            }
        }
        StepConfig::CommunicationGeneration { template, .. } => {
            if template.trim().is_empty() {
                errors.push(format!("step '{id}': template is required"));
            }
        }
        StepConfig::FileOperation {
            operation,
            source,
            destination,
        } => {
            if source.trim().is_empty() {
                errors.push(format!("step '{id}': source is required"));
            }
            let needs_destination =
                matches!(operation, FileOperationKind::Copy | FileOperationKind::Move);
            if needs_destination && destination.as_deref().is_none_or(|d| d.trim().is_empty()) {
                errors.push(format!(
                    "step '{id}': destination is required for copy and move"
                ));
            }
        }
        StepConfig::Notification {
            recipients,
            message,
            ..
        } => {
            if recipients.is_empty() {
                errors.push(format!("step '{id}': at least one recipient is required"));
            }
            if message.trim().is_empty() {
                errors.push(format!("step '{id}': message is required"));
            }
        }
    }

    if let Some(policy) = step.retry_policy.as_ref().filter(|p| p.initial_delay > p.max_delay) {
        errors.push(format!(
            "step '{id}': retry initialDelay ({}) exceeds maxDelay ({})",
            policy.initial_delay, policy.max_delay
        ));
    }
    if step.timeout_ms == Some(0) {
        errors.push(format!("step '{id}': timeoutMs must be > 0"));
    }
}

fn validate_trigger(index: usize, trigger: &TriggerConfig, errors: &mut Vec<String>) {
    match trigger {
        TriggerConfig::Manual {} => {}
        TriggerConfig::Schedule {
            cron_expression,
            timezone,
        } => {
            if let Err(e) = validate_schedule(cron_expression, timezone.as_deref()) {
                errors.push(format!("trigger {index}: {e}"));
            }
        }
        TriggerConfig::FileWatch {
            path,
            pattern,
            ignore_pattern,
            ..
        } => {
            if path.trim().is_empty() {
                errors.push(format!("trigger {index}: file-watch path is required"));
            }
            for (field, value) in [("pattern", pattern), ("ignorePattern", ignore_pattern)] {
                match value.as_deref() {
                    Some(p) if p.is_empty() => {
                        errors.push(format!("trigger {index}: {field} must not be empty"));
                    }
                    Some(p) => {
                        if let Err(e) = Regex::new(p) {
                            errors.push(format!("trigger {index}: invalid {field}: {e}"));
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Definition store
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<serde_json::Value>,
}

/// Loads and persists workflow definitions as one versioned JSON document.
///
/// Read-modify-write operations hold `write_lock`, so concurrent upserts and
/// deletes never lose each other's changes.
pub struct DefinitionStore<R> {
    repo: R,
    write_lock: Mutex<()>,
}

impl<R: DefinitionRepository> DefinitionStore<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    /// Parse a document, rejecting versions outside the supported set.
    pub fn parse_document(contents: &str) -> Result<DefinitionDocument, DefinitionError> {
        let probe: VersionProbe =
            serde_json::from_str(contents).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        let version = match probe.version {
            Some(serde_json::Value::String(v)) => v,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        if !SUPPORTED_DOCUMENT_VERSIONS.contains(&version.as_str()) {
            return Err(DefinitionError::UnsupportedVersion {
                version,
                supported: SUPPORTED_DOCUMENT_VERSIONS.join(", "),
            });
        }
        serde_json::from_str(contents).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    /// The whole document. A missing file reads as an empty document.
    pub async fn load_document(&self) -> Result<DefinitionDocument, DefinitionError> {
        match self.repo.read_document().await? {
            Some(contents) => Self::parse_document(&contents),
            None => Ok(DefinitionDocument::default()),
        }
    }

    pub async fn load(&self) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        Ok(self.load_document().await?.workflows)
    }

    /// Replace every definition, keeping the document's templates and settings.
    pub async fn save(&self, defs: Vec<WorkflowDefinition>) -> Result<(), DefinitionError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        doc.workflows = defs;
        self.write(doc).await
    }

    pub async fn load_one(&self, id: &str) -> Result<Option<WorkflowDefinition>, DefinitionError> {
        Ok(self.load().await?.into_iter().find(|w| w.id == id))
    }

    /// Insert or replace a definition by id. Returns `true` if it was new.
    pub async fn save_one(&self, def: WorkflowDefinition) -> Result<bool, DefinitionError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        let created = match doc.workflows.iter_mut().find(|w| w.id == def.id) {
            Some(existing) => {
                *existing = def;
                false
            }
            None => {
                doc.workflows.push(def);
                true
            }
        };
        self.write(doc).await?;
        Ok(created)
    }

    /// Remove a definition. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, DefinitionError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        let before = doc.workflows.len();
        doc.workflows.retain(|w| w.id != id);
        if doc.workflows.len() == before {
            return Ok(false);
        }
        self.write(doc).await?;
        Ok(true)
    }

    pub fn validate(&self, def: &WorkflowDefinition) -> ValidationReport {
        validate_definition(def)
    }

    /// File-level defaults (`settings` block), empty when absent.
    pub async fn settings(&self) -> Result<DefinitionSettings, DefinitionError> {
        Ok(self.load_document().await?.settings.unwrap_or_default())
    }

    async fn write(&self, mut doc: DefinitionDocument) -> Result<(), DefinitionError> {
        doc.version = CURRENT_DOCUMENT_VERSION.to_string();
        let contents = serde_json::to_string_pretty(&doc)
            .map_err(|e| DefinitionError::Serialize(e.to_string()))?;
        self.repo.write_document(&contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryDefinitionRepository;
    use crate::workflow::dag::test_support::step;
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_types::job::RetryPolicy;
    use stepwise_types::workflow::{FailureMode, ScheduleConfig, StepType};

    fn workflow(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: format!("Workflow {id}"),
            description: None,
            steps,
            triggers: vec![TriggerConfig::Manual {}],
            schedule: None,
            enabled: true,
            on_step_failure: FailureMode::Halt,
            created_at: None,
            updated_at: None,
            metadata: Default::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_valid_definition() {
        let def = workflow("wf", vec![step("a", &[]), step("b", &["a"])]);
        let report = validate_definition(&def);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_cycle_error_names_path() {
        let def = workflow("wf", vec![step("a", &["b"]), step("b", &["a"])]);
        let report = validate_definition(&def);
        assert!(!report.valid);
        assert!(
            report.errors.iter().any(|e| e.contains("a -> b -> a")),
            "{:?}",
            report.errors
        );
    }

    #[test]
    fn test_collects_every_error() {
        let mut def = workflow("", vec![step("a", &["ghost"]), step("a", &[])]);
        def.name = String::new();
        let report = validate_definition(&def);
        assert!(!report.valid);
        let joined = report.errors.join("\n");
        assert!(joined.contains("workflow id is required"));
        assert!(joined.contains("workflow name is required"));
        assert!(joined.contains("duplicate step id 'a'"));
        assert!(joined.contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_empty_steps_rejected() {
        let report = validate_definition(&workflow("wf", vec![]));
        assert!(report.errors.iter().any(|e| e.contains("at least one step")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let report = validate_definition(&workflow("wf", vec![step("a", &["a"])]));
        assert!(report.errors.iter().any(|e| e.contains("depends on itself")));
    }

    #[test]
    fn test_config_type_must_match_step_type() {
        let mut s = step("a", &[]);
        s.step_type = StepType::Estimation;
        let report = validate_definition(&workflow("wf", vec![s]));
        assert!(
            report
                .errors
                .iter()
                .any(|e| e.contains("type 'estimation' but config type 'notification'"))
        );
    }

    #[test]
    fn test_file_operation_copy_needs_destination() {
        let mut s = step("copy", &[]);
        s.step_type = StepType::FileOperation;
        s.config = StepConfig::FileOperation {
            operation: FileOperationKind::Copy,
            source: "/tmp/in.pdf".to_string(),
            destination: None,
        };
        let report = validate_definition(&workflow("wf", vec![s]));
        assert!(report.errors.iter().any(|e| e.contains("destination is required")));
    }

    #[test]
    fn test_estimation_ranges() {
        let mut s = step("est", &[]);
        s.step_type = StepType::Estimation;
        s.config = StepConfig::Estimation {
            methodology: None,
            hourly_rate: Some(0.0),
            contingency_percent: Some(150.0),
        };
        let report = validate_definition(&workflow("wf", vec![s]));
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let mut s = step("a", &[]);
        s.retry_policy = Some(RetryPolicy {
            initial_delay: 10_000,
            max_delay: 1_000,
            ..RetryPolicy::default()
        });
        let report = validate_definition(&workflow("wf", vec![s]));
        assert!(report.errors.iter().any(|e| e.contains("exceeds maxDelay")));
    }

    #[test]
    fn test_trigger_checks() {
        let mut def = workflow("wf", vec![step("a", &[])]);
        def.triggers = vec![
            TriggerConfig::Schedule {
                cron_expression: "not a cron".to_string(),
                timezone: None,
            },
            TriggerConfig::Schedule {
                cron_expression: "0 9 * * *".to_string(),
                timezone: Some("Mars/Olympus".to_string()),
            },
            TriggerConfig::FileWatch {
                path: "/srv/inbox".to_string(),
                pattern: Some("([".to_string()),
                ignore_pattern: None,
                recursive: true,
            },
        ];
        let report = validate_definition(&def);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors[0].starts_with("trigger 0"));
        assert!(report.errors[2].contains("invalid pattern"));
    }

    #[test]
    fn test_warnings_do_not_invalidate() {
        let mut def = workflow("wf", vec![step("a", &[]), step("b", &[])]);
        def.triggers.clear();
        def.enabled = false;
        let report = validate_definition(&def);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 4, "{:?}", report.warnings);
    }

    #[test]
    fn test_queue_override_warns_that_step_will_fail() {
        let mut overridden = step("a", &[]);
        overridden.queue = Some(stepwise_types::job::QueueName::AiAnalysis);
        let report = validate_definition(&workflow("wf", vec![overridden]));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
        assert!(report.warnings[0].contains("will fail"));
        assert!(report.warnings[0].contains("'ai-analysis'"));
    }

    #[test]
    fn test_top_level_schedule_validated() {
        let mut def = workflow("wf", vec![step("a", &[])]);
        def.schedule = Some(ScheduleConfig::new("every 0 minutes"));
        let report = validate_definition(&def);
        assert!(report.errors.iter().any(|e| e.starts_with("schedule:")));
    }

    // -----------------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_document_loads_empty() {
        let store = DefinitionStore::new(MemoryDefinitionRepository::new());
        assert!(store.load().await.unwrap().is_empty());
        assert_eq!(store.settings().await.unwrap(), DefinitionSettings::default());
    }

    #[tokio::test]
    async fn test_unsupported_version_rejected() {
        let repo = MemoryDefinitionRepository::with_document(
            json!({"version": "2.0", "workflows": []}).to_string(),
        );
        let store = DefinitionStore::new(repo);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, DefinitionError::UnsupportedVersion { ref version, .. } if version == "2.0"));
    }

    #[tokio::test]
    async fn test_save_one_upserts_and_preserves_settings() {
        let repo = MemoryDefinitionRepository::with_document(
            json!({
                "version": "1.0",
                "workflows": [],
                "templates": [{"id": "tpl"}],
                "settings": {"defaultTimeout": 5000}
            })
            .to_string(),
        );
        let store = DefinitionStore::new(repo);

        assert!(store.save_one(workflow("wf", vec![step("a", &[])])).await.unwrap());
        let mut updated = workflow("wf", vec![step("a", &[])]);
        updated.name = "Renamed".to_string();
        assert!(!store.save_one(updated).await.unwrap());

        let doc = store.load_document().await.unwrap();
        assert_eq!(doc.version, CURRENT_DOCUMENT_VERSION);
        assert_eq!(doc.workflows.len(), 1);
        assert_eq!(doc.workflows[0].name, "Renamed");
        assert_eq!(doc.templates.unwrap().len(), 1);
        assert_eq!(doc.settings.unwrap().default_timeout, Some(5000));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = DefinitionStore::new(MemoryDefinitionRepository::new());
        store.save_one(workflow("wf", vec![step("a", &[])])).await.unwrap();
        assert!(store.delete("wf").await.unwrap());
        assert!(!store.delete("wf").await.unwrap());
        assert!(store.load_one("wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let store = Arc::new(DefinitionStore::new(MemoryDefinitionRepository::new()));
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save_one(workflow(&format!("wf-{i}"), vec![step("a", &[])]))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.load().await.unwrap().len(), 10);
    }
}
