//! SQLite execution repository implementation.
//!
//! Each execution is stored as one JSON record plus the columns used for
//! filtering. The engine writes the whole record on every transition.

use chrono::Utc;
use sqlx::Row;
use stepwise_core::repository::ExecutionRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::WorkflowExecution;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, query_error};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    let record: String = row.try_get("record").map_err(query_error)?;
    serde_json::from_str(&record)
        .map_err(|e| RepositoryError::Query(format!("invalid execution JSON: {e}")))
}

fn decode_all(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowExecution>, RepositoryError> {
    rows.iter().map(decode).collect()
}

impl ExecutionRepository for SqliteExecutionRepository {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let record = serde_json::to_string(execution)
            .map_err(|e| RepositoryError::Query(format!("serialize execution: {e}")))?;

        sqlx::query(
            r#"INSERT INTO executions
               (execution_id, workflow_id, status, record, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
                 status = excluded.status,
                 record = excluded.record,
                 completed_at = excluded.completed_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.workflow_id)
        .bind(execution.status.as_str())
        .bind(&record)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM executions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        // UUIDv7 text sorts by creation time.
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(
                    "SELECT record FROM executions WHERE workflow_id = ? ORDER BY execution_id DESC LIMIT ?",
                )
                .bind(id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT record FROM executions ORDER BY execution_id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        decode_all(&rows)
    }

    async fn list_unfinished(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM executions WHERE status IN ('pending', 'running', 'paused') ORDER BY execution_id",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        decode_all(&rows)
    }
}
