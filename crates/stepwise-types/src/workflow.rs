//! Workflow definition types.
//!
//! `WorkflowDefinition` is the persisted shape of a workflow: an acyclic graph
//! of typed steps plus the triggers that start it. Definitions live in a
//! versioned JSON document (`DefinitionDocument`); execution tracking types
//! live in [`crate::execution`].

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobPriority, QueueName, RetryPolicy};

// ---------------------------------------------------------------------------
// Definition document
// ---------------------------------------------------------------------------

/// Document versions the definition store can read.
pub const SUPPORTED_DOCUMENT_VERSIONS: &[&str] = &["1.0", "1.1"];

/// Version written on every save.
pub const CURRENT_DOCUMENT_VERSION: &str = "1.1";

/// The on-disk definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDocument {
    pub version: String,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    /// Opaque workflow templates, preserved untouched across saves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<DefinitionSettings>,
}

impl Default for DefinitionDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_DOCUMENT_VERSION.to_string(),
            workflows: Vec::new(),
            templates: None,
            settings: None,
        }
    }
}

/// File-level defaults applied to steps that do not override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSettings {
    /// Default job timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Upper bound on concurrently outstanding steps per execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A stored workflow: typed steps forming a DAG, plus triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (user chosen, e.g. "rfp-intake").
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Primary cron schedule; takes precedence over `schedule` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub on_step_failure: FailureMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDefinition {
    /// The schedule the scheduler should register, if any.
    ///
    /// The top-level `schedule` wins; otherwise the first `schedule` trigger.
    pub fn effective_schedule(&self) -> Option<ScheduleConfig> {
        if let Some(schedule) = &self.schedule {
            return Some(schedule.clone());
        }
        self.triggers.iter().find_map(|t| match t {
            TriggerConfig::Schedule {
                cron_expression,
                timezone,
            } => Some(ScheduleConfig {
                cron_expression: cron_expression.clone(),
                timezone: timezone.clone(),
                enabled: true,
            }),
            _ => None,
        })
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// What happens to the rest of an execution when a step fails permanently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Fail the execution and skip every step not yet started.
    #[default]
    Halt,
    /// Skip only the failed step's dependants; independent branches finish.
    Continue,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub config: StepConfig,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default, alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,
    /// Overrides the step type's default queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueName>,
}

impl StepDefinition {
    pub fn queue(&self) -> QueueName {
        self.queue.unwrap_or_else(|| self.step_type.default_queue())
    }
}

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    DocumentAnalysis,
    RequirementExtraction,
    Estimation,
    CommunicationGeneration,
    FileOperation,
    Notification,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::DocumentAnalysis,
        StepType::RequirementExtraction,
        StepType::Estimation,
        StepType::CommunicationGeneration,
        StepType::FileOperation,
        StepType::Notification,
    ];

    /// The job type string processors are registered under.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::DocumentAnalysis => "document-analysis",
            StepType::RequirementExtraction => "requirement-extraction",
            StepType::Estimation => "estimation",
            StepType::CommunicationGeneration => "communication-generation",
            StepType::FileOperation => "file-operation",
            StepType::Notification => "notification",
        }
    }

    /// Queue a step of this kind is enqueued on unless overridden.
    pub fn default_queue(&self) -> QueueName {
        match self {
            StepType::DocumentAnalysis | StepType::RequirementExtraction => {
                QueueName::DocumentProcessing
            }
            StepType::Estimation | StepType::CommunicationGeneration => QueueName::AiAnalysis,
            StepType::FileOperation => QueueName::FileOperations,
            StepType::Notification => QueueName::Notifications,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-specific configuration, internally tagged by `type`:
///
/// ```json
/// "config": { "type": "notification", "channel": "email",
///             "recipients": ["pm@example.com"], "message": "Estimate ready" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepConfig {
    #[serde(rename_all = "camelCase")]
    DocumentAnalysis {
        /// Document id or path handed to the document service.
        source: String,
        #[serde(default)]
        extract_tables: bool,
    },
    #[serde(rename_all = "camelCase")]
    RequirementExtraction {
        source: String,
        #[serde(default)]
        categories: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Estimation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        methodology: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hourly_rate: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contingency_percent: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    CommunicationGeneration {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tone: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileOperation {
        operation: FileOperationKind,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Notification {
        channel: String,
        recipients: Vec<String>,
        message: String,
    },
}

impl StepConfig {
    /// The step kind this configuration belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::DocumentAnalysis { .. } => StepType::DocumentAnalysis,
            StepConfig::RequirementExtraction { .. } => StepType::RequirementExtraction,
            StepConfig::Estimation { .. } => StepType::Estimation,
            StepConfig::CommunicationGeneration { .. } => StepType::CommunicationGeneration,
            StepConfig::FileOperation { .. } => StepType::FileOperation,
            StepConfig::Notification { .. } => StepType::Notification,
        }
    }
}

/// Filesystem operation performed by a `file-operation` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileOperationKind {
    Copy,
    Move,
    Delete,
    Mkdir,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a workflow gets started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TriggerConfig {
    Manual {},
    #[serde(rename_all = "camelCase")]
    FileWatch {
        path: String,
        /// Regex matched against changed file paths.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ignore_pattern: Option<String>,
        #[serde(default = "default_enabled")]
        recursive: bool,
    },
    #[serde(rename_all = "camelCase")]
    Schedule {
        cron_expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

/// A cron schedule for a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    /// 5- or 6-field cron expression, or a phrase like "every 5 minutes".
    pub cron_expression: String,
    /// IANA zone ("Europe/Berlin") or fixed offset ("+05:30"); UTC when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleConfig {
    pub fn new(cron_expression: impl Into<String>) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            timezone: None,
            enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Outcome of validating a workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}
