//! Job store trait definition.
//!
//! The job store is the durable backing store behind the queue manager. Every
//! state transition is atomic and conditional on the job's current state, so
//! at most one worker ever owns an active job.

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::job::{JobCounts, JobState, QueueName, StoredJob};

/// Durable job storage with atomic claim semantics.
pub trait JobStore: Send + Sync {
    /// Persist a newly enqueued job.
    fn insert(
        &self,
        job: &StoredJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        job_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StoredJob>, RepositoryError>> + Send;

    /// Atomically move the best ready job of `queue` from `waiting` to `active`.
    ///
    /// "Best" is the lowest priority rank, then the earliest enqueue. Only jobs
    /// with `available_at <= now` are eligible. The claim increments
    /// `attempts_made` and stamps `processed_at`.
    fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<StoredJob>, RepositoryError>> + Send;

    /// Record progress on an active job. Returns `false` if the job is not active.
    fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `active -> completed`. Returns `false` if the job was not active.
    fn complete(
        &self,
        job_id: &str,
        result: &serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `active -> waiting` with a backoff delay. Returns `false` if the job was not active.
    fn schedule_retry(
        &self,
        job_id: &str,
        reason: &str,
        available_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `active -> failed` (permanent). Returns `false` if the job was not active.
    fn fail(
        &self,
        job_id: &str,
        reason: &str,
        finished_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `failed -> waiting` with attempts reset (manual retry).
    /// Returns `false` if the job does not exist or is not failed.
    fn reset_failed(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<JobCounts, RepositoryError>> + Send;

    /// Delete jobs of `queue` in terminal `state` that finished before `older_than`.
    fn clean(
        &self,
        queue: QueueName,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Return every `active` job of `queue` to `waiting` (recovery after a crash).
    fn requeue_active(
        &self,
        queue: QueueName,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Cheap liveness probe.
    fn ping(&self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
