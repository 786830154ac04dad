//! SQLite job store implementation.
//!
//! Implements `JobStore` from `stepwise-core`. Job data is stored as a JSON
//! blob next to the columns the queue manager filters and orders on. Claims
//! are a single `UPDATE ... RETURNING` against the writer connection, so two
//! dispatchers can never claim the same job.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::JobStore;
use stepwise_types::error::RepositoryError;
use stepwise_types::job::{JobCounts, JobData, JobState, QueueName, StoredJob};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, query_error};

const JOB_COLUMNS: &str = "data, queue, state, attempts_made, progress, available_at, \
                           failed_reason, result, processed_at, finished_at";

/// SQLite-backed implementation of `JobStore`.
pub struct SqliteJobStore {
    pool: DatabasePool,
}

impl SqliteJobStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct JobRow {
    data: String,
    queue: String,
    state: String,
    attempts_made: i64,
    progress: i64,
    available_at: String,
    failed_reason: Option<String>,
    result: Option<String>,
    processed_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            data: row.try_get("data")?,
            queue: row.try_get("queue")?,
            state: row.try_get("state")?,
            attempts_made: row.try_get("attempts_made")?,
            progress: row.try_get("progress")?,
            available_at: row.try_get("available_at")?,
            failed_reason: row.try_get("failed_reason")?,
            result: row.try_get("result")?,
            processed_at: row.try_get("processed_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_job(self) -> Result<StoredJob, RepositoryError> {
        let data: JobData = serde_json::from_str(&self.data)
            .map_err(|e| RepositoryError::Query(format!("invalid job data JSON: {e}")))?;
        let queue: QueueName = self.queue.parse().map_err(RepositoryError::Query)?;
        let state: JobState = self.state.parse().map_err(RepositoryError::Query)?;
        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid job result: {e}")))
            })
            .transpose()?;

        Ok(StoredJob {
            data,
            queue,
            state,
            attempts_made: self.attempts_made.max(0) as u32,
            available_at: parse_datetime(&self.available_at)?,
            progress: self.progress.clamp(0, 100) as u8,
            failed_reason: self.failed_reason,
            result,
            processed_at: self.processed_at.as_deref().map(parse_datetime).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<StoredJob, RepositoryError> {
    JobRow::from_row(row).map_err(query_error)?.into_job()
}

fn millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

// ---------------------------------------------------------------------------
// JobStore impl
// ---------------------------------------------------------------------------

impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &StoredJob) -> Result<(), RepositoryError> {
        let data = serde_json::to_string(&job.data)
            .map_err(|e| RepositoryError::Query(format!("serialize job data: {e}")))?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO jobs
               (id, queue, job_type, state, priority_rank, data, attempts_made, progress,
                available_at, available_at_ms, failed_reason, result, processed_at,
                finished_at, finished_at_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.data.id)
        .bind(job.queue.as_str())
        .bind(&job.data.job_type)
        .bind(job.state.as_str())
        .bind(job.data.options.priority.rank())
        .bind(&data)
        .bind(i64::from(job.attempts_made))
        .bind(i64::from(job.progress))
        .bind(format_datetime(&job.available_at))
        .bind(millis(&job.available_at))
        .bind(&job.failed_reason)
        .bind(&result)
        .bind(job.processed_at.as_ref().map(format_datetime))
        .bind(job.finished_at.as_ref().map(format_datetime))
        .bind(job.finished_at.as_ref().map(millis))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("job '{}' already exists", job.data.id))
            }
            other => query_error(other),
        })?;

        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StoredJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"UPDATE jobs
               SET state = 'active', attempts_made = attempts_made + 1, processed_at = ?
               WHERE rowid = (
                   SELECT rowid FROM jobs
                   WHERE queue = ? AND state = 'waiting' AND available_at_ms <= ?
                   ORDER BY priority_rank ASC, rowid ASC
                   LIMIT 1
               )
               RETURNING {JOB_COLUMNS}"#
        ))
        .bind(format_datetime(&now))
        .bind(queue.as_str())
        .bind(millis(&now))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_progress(&self, job_id: &str, progress: u8) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE jobs SET progress = ? WHERE id = ? AND state = 'active'")
            .bind(i64::from(progress.min(100)))
            .bind(job_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        job_id: &str,
        result: &serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| RepositoryError::Query(format!("serialize job result: {e}")))?;

        let outcome = sqlx::query(
            r#"UPDATE jobs
               SET state = 'completed', progress = 100, result = ?, failed_reason = NULL,
                   finished_at = ?, finished_at_ms = ?
               WHERE id = ? AND state = 'active'"#,
        )
        .bind(&result_json)
        .bind(format_datetime(&finished_at))
        .bind(millis(&finished_at))
        .bind(job_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        job_id: &str,
        reason: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let outcome = sqlx::query(
            r#"UPDATE jobs
               SET state = 'waiting', failed_reason = ?, available_at = ?, available_at_ms = ?
               WHERE id = ? AND state = 'active'"#,
        )
        .bind(reason)
        .bind(format_datetime(&available_at))
        .bind(millis(&available_at))
        .bind(job_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn fail(
        &self,
        job_id: &str,
        reason: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let outcome = sqlx::query(
            r#"UPDATE jobs
               SET state = 'failed', failed_reason = ?, finished_at = ?, finished_at_ms = ?
               WHERE id = ? AND state = 'active'"#,
        )
        .bind(reason)
        .bind(format_datetime(&finished_at))
        .bind(millis(&finished_at))
        .bind(job_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn reset_failed(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let outcome = sqlx::query(
            r#"UPDATE jobs
               SET state = 'waiting', attempts_made = 0, progress = 0, failed_reason = NULL,
                   finished_at = NULL, finished_at_ms = NULL,
                   available_at = ?, available_at_ms = ?
               WHERE id = ? AND state = 'failed'"#,
        )
        .bind(format_datetime(&available_at))
        .bind(millis(&available_at))
        .bind(job_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<JobCounts, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT state,
                      COUNT(*) AS total,
                      COALESCE(SUM(CASE WHEN available_at_ms > ? THEN 1 ELSE 0 END), 0) AS delayed
               FROM jobs
               WHERE queue = ?
               GROUP BY state"#,
        )
        .bind(millis(&now))
        .bind(queue.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut counts = JobCounts::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(query_error)?;
            let total: i64 = row.try_get("total").map_err(query_error)?;
            let total = total.max(0) as u64;
            match state.parse::<JobState>().map_err(RepositoryError::Query)? {
                JobState::Waiting => {
                    let delayed: i64 = row.try_get("delayed").map_err(query_error)?;
                    counts.waiting = total;
                    counts.delayed = delayed.max(0) as u64;
                }
                JobState::Active => counts.active = total,
                JobState::Completed => counts.completed = total,
                JobState::Failed => counts.failed = total,
            }
        }
        Ok(counts)
    }

    async fn clean(
        &self,
        queue: QueueName,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let outcome = sqlx::query(
            r#"DELETE FROM jobs
               WHERE queue = ? AND state = ? AND finished_at_ms IS NOT NULL AND finished_at_ms < ?"#,
        )
        .bind(queue.as_str())
        .bind(state.as_str())
        .bind(millis(&older_than))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(outcome.rows_affected())
    }

    async fn requeue_active(&self, queue: QueueName) -> Result<u64, RepositoryError> {
        let outcome =
            sqlx::query("UPDATE jobs SET state = 'waiting' WHERE queue = ? AND state = 'active'")
                .bind(queue.as_str())
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;
        Ok(outcome.rows_affected())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool.reader)
            .await
            .map_err(|_| RepositoryError::Connection)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};
    use stepwise_core::processor::{
        ProcessorError, ProcessorRegistration, ProcessorRegistry,
    };
    use stepwise_core::queue::{JobContext, QueueManager};
    use stepwise_types::config::EngineConfig;
    use stepwise_types::job::JobPriority;

    use crate::sqlite::pool::test_support::pool;

    fn job(queue: QueueName, priority: JobPriority) -> StoredJob {
        StoredJob::waiting(
            queue,
            JobData::new("estimation", json!({"n": 1})).with_priority(priority),
        )
    }

    async fn store(dir: &tempfile::TempDir) -> SqliteJobStore {
        SqliteJobStore::new(pool(dir).await)
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let low = job(QueueName::AiAnalysis, JobPriority::Low);
        let high = job(QueueName::AiAnalysis, JobPriority::High);
        let medium_a = job(QueueName::AiAnalysis, JobPriority::Medium);
        let medium_b = job(QueueName::AiAnalysis, JobPriority::Medium);
        for j in [&low, &high, &medium_a, &medium_b] {
            store.insert(j).await.unwrap();
        }

        let now = Utc::now() + Duration::seconds(1);
        let mut order = Vec::new();
        while let Some(claimed) = store.claim_next(QueueName::AiAnalysis, now).await.unwrap() {
            assert_eq!(claimed.state, JobState::Active);
            assert_eq!(claimed.attempts_made, 1);
            assert!(claimed.processed_at.is_some());
            order.push(claimed.data.id);
        }
        assert_eq!(
            order,
            vec![high.data.id, medium_a.data.id, medium_b.data.id, low.data.id]
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let j = job(QueueName::Notifications, JobPriority::Medium);
        store.insert(&j).await.unwrap();
        assert!(matches!(
            store.insert(&j).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_skips_other_queues_and_delayed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let mut delayed = job(QueueName::Notifications, JobPriority::High);
        delayed.available_at = Utc::now() + Duration::hours(1);
        store.insert(&delayed).await.unwrap();
        store
            .insert(&job(QueueName::AiAnalysis, JobPriority::Medium))
            .await
            .unwrap();

        let claimed = store
            .claim_next(QueueName::Notifications, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_none());

        let counts = store.counts(QueueName::Notifications, Utc::now()).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_transitions_require_active_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let j = job(QueueName::AiAnalysis, JobPriority::Medium);
        store.insert(&j).await.unwrap();

        assert!(!store.complete(&j.data.id, &json!(1), Utc::now()).await.unwrap());
        assert!(!store.update_progress(&j.data.id, 10).await.unwrap());
        store
            .claim_next(QueueName::AiAnalysis, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(store.update_progress(&j.data.id, 40).await.unwrap());
        assert!(store
            .complete(&j.data.id, &json!({"hours": 12}), Utc::now())
            .await
            .unwrap());
        assert!(!store.fail(&j.data.id, "late", Utc::now()).await.unwrap());

        let stored = store.get(&j.data.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.result, Some(json!({"hours": 12})));
        assert_eq!(stored.data, j.data);
    }

    #[tokio::test]
    async fn test_retry_then_permanent_failure_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let j = job(QueueName::FileOperations, JobPriority::Medium);
        store.insert(&j).await.unwrap();
        let later = Utc::now() + Duration::seconds(1);

        store.claim_next(QueueName::FileOperations, later).await.unwrap();
        let retry_at = later + Duration::milliseconds(500);
        assert!(store.schedule_retry(&j.data.id, "disk busy", retry_at).await.unwrap());
        assert!(store
            .claim_next(QueueName::FileOperations, later)
            .await
            .unwrap()
            .is_none());

        let reclaimed = store
            .claim_next(QueueName::FileOperations, retry_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts_made, 2);
        assert_eq!(reclaimed.failed_reason.as_deref(), Some("disk busy"));

        assert!(store.fail(&j.data.id, "disk gone", Utc::now()).await.unwrap());
        let counts = store.counts(QueueName::FileOperations, Utc::now()).await.unwrap();
        assert_eq!(counts.failed, 1);

        assert!(store.reset_failed(&j.data.id, Utc::now()).await.unwrap());
        assert!(!store.reset_failed(&j.data.id, Utc::now()).await.unwrap());
        let reset = store.get(&j.data.id).await.unwrap().unwrap();
        assert_eq!(reset.state, JobState::Waiting);
        assert_eq!(reset.attempts_made, 0);
        assert!(reset.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_clean_and_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let done = job(QueueName::Notifications, JobPriority::High);
        let running = job(QueueName::Notifications, JobPriority::Low);
        store.insert(&done).await.unwrap();
        store.insert(&running).await.unwrap();

        let later = Utc::now() + Duration::seconds(1);
        store.claim_next(QueueName::Notifications, later).await.unwrap();
        store.claim_next(QueueName::Notifications, later).await.unwrap();
        store
            .complete(&done.data.id, &json!(null), Utc::now() - Duration::hours(2))
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::hours(1);
        assert_eq!(
            store
                .clean(QueueName::Notifications, JobState::Completed, cutoff)
                .await
                .unwrap(),
            1
        );
        assert!(store.get(&done.data.id).await.unwrap().is_none());

        assert_eq!(store.requeue_active(QueueName::Notifications).await.unwrap(), 1);
        let requeued = store.get(&running.data.id).await.unwrap().unwrap();
        assert_eq!(requeued.state, JobState::Waiting);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_manager_runs_jobs_from_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let manager = QueueManager::new(Arc::new(store(&dir).await), &config);

        let mut registry = ProcessorRegistry::new();
        registry.register_processor(ProcessorRegistration {
            name: "estimation".to_string(),
            queue_name: QueueName::AiAnalysis,
            concurrency: None,
            processor: Arc::new(
                |job: JobData, _ctx: JobContext| -> BoxFuture<'static, Result<Value, ProcessorError>> {
                    Box::pin(async move { Ok(json!({ "echo": job.payload["n"] })) })
                },
            ),
        });

        let id = manager
            .add_job(
                QueueName::AiAnalysis,
                JobData::new("estimation", json!({"n": 7})),
                None,
            )
            .await
            .unwrap();
        manager.start(Arc::new(registry)).await.unwrap();

        let mut status = None;
        for _ in 0..300 {
            let current = manager.get_job(&id).await.unwrap().unwrap();
            if current.state == JobState::Completed {
                status = Some(current);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        let status = status.expect("job never completed");
        assert_eq!(status.result, Some(json!({"echo": 7})));
        assert_eq!(status.attempts_made, 1);
        manager.shutdown().await;
    }
}
