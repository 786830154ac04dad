//! Execution tracking types.
//!
//! A `WorkflowExecution` is one run of a workflow definition. The engine is its
//! only writer; once `status` is terminal the record never changes again.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Execution state machine:
/// `pending -> running -> {completed, failed, cancelled}`, with
/// `running <-> paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Status of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Dependencies not yet satisfied (or held while paused).
    Pending,
    /// Enqueued as a job; outcome outstanding.
    Queued,
    Completed,
    Failed,
    /// Never started because an upstream step failed.
    Skipped,
}

/// Per-step bookkeeping inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            job_id: None,
            output: None,
            error: None,
            attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line in an execution's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What started an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Schedule,
    FileWatch,
    Retry,
    Queue,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::FileWatch => "file-watch",
            TriggerSource::Retry => "retry",
            TriggerSource::Queue => "queue",
        };
        f.write_str(s)
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Percentage of steps completed, 0..=100.
    pub progress: u8,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
    #[serde(default)]
    pub trigger: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Wall-clock duration, if the execution has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, step_id: Option<&str>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step_id: step_id.map(str::to_string),
        });
    }
}

/// Value returned by a synchronous `execute_workflow` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Output of every completed step, keyed by step id.
    pub results: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl From<&WorkflowExecution> for WorkflowResult {
    fn from(execution: &WorkflowExecution) -> Self {
        let results = execution
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .filter_map(|(id, s)| s.output.clone().map(|o| (id.clone(), o)))
            .collect();
        Self {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id.clone(),
            status: execution.status,
            results,
            error: execution.error.clone(),
            duration_ms: execution.duration_ms().unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Aggregates over the execution history of one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Pending, running or paused executions.
    pub active: u64,
    /// Completed / terminal, in 0.0..=1.0.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Aggregates across every workflow and queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub workflows: u64,
    pub enabled_workflows: u64,
    pub executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active_executions: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub queued_jobs: u64,
    pub active_jobs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn execution() -> WorkflowExecution {
        WorkflowExecution {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            status: ExecutionStatus::Completed,
            input: json!({}),
            current_step: None,
            progress: 100,
            logs: vec![],
            result: None,
            error: None,
            steps: BTreeMap::new(),
            trigger: TriggerSource::Manual,
            retry_of: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert_eq!(
            "cancelled".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::Cancelled
        );
    }

    #[test]
    fn result_only_includes_completed_steps() {
        let mut exec = execution();
        exec.completed_at = Some(exec.started_at + Duration::milliseconds(250));
        exec.steps.insert(
            "a".to_string(),
            StepState {
                status: StepStatus::Completed,
                output: Some(json!({"pages": 3})),
                ..StepState::pending()
            },
        );
        exec.steps.insert(
            "b".to_string(),
            StepState {
                status: StepStatus::Queued,
                output: Some(json!("discarded")),
                ..StepState::pending()
            },
        );

        let result = WorkflowResult::from(&exec);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results["a"], json!({"pages": 3}));
        assert_eq!(result.duration_ms, 250);
    }

    #[test]
    fn log_appends_entry() {
        let mut exec = execution();
        exec.log(LogLevel::Warn, "step retried", Some("a"));
        assert_eq!(exec.logs.len(), 1);
        assert_eq!(exec.logs[0].step_id.as_deref(), Some("a"));
    }
}
