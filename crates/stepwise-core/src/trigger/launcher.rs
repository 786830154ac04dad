//! The seam through which triggers start workflow executions.

use futures_util::future::BoxFuture;
use stepwise_types::execution::TriggerSource;
use uuid::Uuid;

/// Why a trigger could not start an execution.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    #[error("launch failed: {0}")]
    Failed(String),
}

/// Starts a workflow execution without waiting for it to finish.
///
/// Implemented by the workflow engine; held as `Arc<dyn WorkflowLauncher>` by
/// the scheduler, the file watcher, and the `execute-workflow` processor.
pub trait WorkflowLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        workflow_id: &'a str,
        input: serde_json::Value,
        source: TriggerSource,
    ) -> BoxFuture<'a, Result<Uuid, LaunchError>>;
}
