//! Execution repository trait definition.

use stepwise_types::error::RepositoryError;
use stepwise_types::execution::WorkflowExecution;
use uuid::Uuid;

/// Write-through persistence for workflow executions.
///
/// The engine is the only writer; every state transition is saved as a
/// whole-record upsert.
pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace an execution by its id.
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions, newest first, optionally filtered by workflow.
    fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions whose status is not terminal (crash recovery).
    fn list_unfinished(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;
}
