//! Event types broadcast by the queue manager and the workflow engine.
//!
//! All events are Clone + Send + Sync for use with tokio broadcast channels
//! and synchronous hook registries.

use serde::{Deserialize, Serialize};

use crate::execution::WorkflowExecution;
use crate::job::QueueName;
use crate::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Queue events
// ---------------------------------------------------------------------------

/// A running job reported progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgressEvent {
    pub queue: QueueName,
    pub job_id: String,
    pub job_type: String,
    pub progress: u8,
}

/// A job's handler returned successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletedEvent {
    pub queue: QueueName,
    pub job_id: String,
    pub job_type: String,
    pub result: serde_json::Value,
    pub attempts_made: u32,
}

/// A job attempt failed. `will_retry` is false once the job is permanently failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailedEvent {
    pub queue: QueueName,
    pub job_id: String,
    pub job_type: String,
    pub reason: String,
    pub attempts_made: u32,
    pub will_retry: bool,
}

/// Everything the queue manager publishes on its event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded { queue: QueueName, job_id: String },
    JobActive { queue: QueueName, job_id: String, attempt: u32 },
    JobProgress(JobProgressEvent),
    JobCompleted(JobCompletedEvent),
    JobFailed(JobFailedEvent),
    QueuePaused { queue: QueueName },
    QueueResumed { queue: QueueName },
}

// ---------------------------------------------------------------------------
// Workflow events
// ---------------------------------------------------------------------------

/// Execution lifecycle events, each carrying a snapshot of the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted { execution: WorkflowExecution },
    ExecutionProgress { execution: WorkflowExecution },
    ExecutionCompleted { execution: WorkflowExecution },
    ExecutionFailed { execution: WorkflowExecution },
    ExecutionPaused { execution: WorkflowExecution },
    ExecutionResumed { execution: WorkflowExecution },
    ExecutionCancelled { execution: WorkflowExecution },
}

impl WorkflowEvent {
    pub fn execution(&self) -> &WorkflowExecution {
        match self {
            WorkflowEvent::ExecutionStarted { execution }
            | WorkflowEvent::ExecutionProgress { execution }
            | WorkflowEvent::ExecutionCompleted { execution }
            | WorkflowEvent::ExecutionFailed { execution }
            | WorkflowEvent::ExecutionPaused { execution }
            | WorkflowEvent::ExecutionResumed { execution }
            | WorkflowEvent::ExecutionCancelled { execution } => execution,
        }
    }
}

/// Published when a stored definition changes, so triggers can resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DefinitionChange {
    Created { workflow: WorkflowDefinition },
    Updated { workflow: WorkflowDefinition },
    Deleted { workflow_id: String },
}

impl DefinitionChange {
    pub fn workflow_id(&self) -> &str {
        match self {
            DefinitionChange::Created { workflow } | DefinitionChange::Updated { workflow } => {
                &workflow.id
            }
            DefinitionChange::Deleted { workflow_id } => workflow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_event_serializes_with_tag() {
        let event = QueueEvent::JobFailed(JobFailedEvent {
            queue: QueueName::Notifications,
            job_id: "j1".to_string(),
            job_type: "notification".to_string(),
            reason: "smtp down".to_string(),
            attempts_made: 1,
            will_retry: true,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "job_failed");
        assert_eq!(value["queue"], "notifications");
        assert_eq!(value["will_retry"], json!(true));
    }

    #[test]
    fn definition_change_reports_workflow_id() {
        let change = DefinitionChange::Deleted {
            workflow_id: "nightly".to_string(),
        };
        assert_eq!(change.workflow_id(), "nightly");
    }
}
