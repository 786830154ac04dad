//! In-memory repository implementations.
//!
//! Used by unit tests and by `stepwise run --ephemeral`. Each store guards its
//! state with a single mutex, which makes every operation trivially atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::WorkflowExecution;
use stepwise_types::job::{JobCounts, JobState, QueueName, StoredJob};
use uuid::Uuid;

use super::{DefinitionRepository, ExecutionRepository, JobStore};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Holds the definition document as a string.
#[derive(Debug, Default)]
pub struct MemoryDefinitionRepository {
    document: Mutex<Option<String>>,
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing document (e.g. a fixture).
    pub fn with_document(contents: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(contents.into())),
        }
    }
}

impl DefinitionRepository for MemoryDefinitionRepository {
    async fn read_document(&self) -> Result<Option<String>, RepositoryError> {
        Ok(guard(&self.document).clone())
    }

    async fn write_document(&self, contents: &str) -> Result<(), RepositoryError> {
        *guard(&self.document) = Some(contents.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryExecutionRepository {
    executions: Mutex<HashMap<Uuid, WorkflowExecution>>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for MemoryExecutionRepository {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        guard(&self.executions).insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(guard(&self.executions).get(execution_id).cloned())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut list: Vec<WorkflowExecution> = guard(&self.executions)
            .values()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == id))
            .cloned()
            .collect();
        // UUIDv7 ids sort by creation time.
        list.sort_by(|a, b| b.execution_id.cmp(&a.execution_id));
        list.truncate(limit as usize);
        Ok(list)
    }

    async fn list_unfinished(&self) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(guard(&self.executions)
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct JobTable {
    next_seq: u64,
    /// job id -> (enqueue sequence, job)
    jobs: HashMap<String, (u64, StoredJob)>,
}

impl JobTable {
    fn active_mut(&mut self, job_id: &str) -> Option<&mut StoredJob> {
        self.jobs
            .get_mut(job_id)
            .map(|(_, job)| job)
            .filter(|job| job.state == JobState::Active)
    }
}

/// Job store backed by a hash map. Claims scan the queue under the lock.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &StoredJob) -> Result<(), RepositoryError> {
        let mut table = guard(&self.table);
        if table.jobs.contains_key(&job.data.id) {
            return Err(RepositoryError::Conflict(format!(
                "job '{}' already exists",
                job.data.id
            )));
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.jobs.insert(job.data.id.clone(), (seq, job.clone()));
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StoredJob>, RepositoryError> {
        Ok(guard(&self.table).jobs.get(job_id).map(|(_, job)| job.clone()))
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredJob>, RepositoryError> {
        let mut table = guard(&self.table);
        let best = table
            .jobs
            .iter()
            .filter(|(_, (_, job))| {
                job.queue == queue && job.state == JobState::Waiting && job.available_at <= now
            })
            .min_by_key(|(_, (seq, job))| (job.data.options.priority.rank(), *seq))
            .map(|(id, _)| id.clone());

        let Some(id) = best else {
            return Ok(None);
        };
        let Some((_, job)) = table.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, job_id: &str, progress: u8) -> Result<bool, RepositoryError> {
        let mut table = guard(&self.table);
        Ok(match table.active_mut(job_id) {
            Some(job) => {
                job.progress = progress.min(100);
                true
            }
            None => false,
        })
    }

    async fn complete(
        &self,
        job_id: &str,
        result: &serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut table = guard(&self.table);
        Ok(match table.active_mut(job_id) {
            Some(job) => {
                job.state = JobState::Completed;
                job.progress = 100;
                job.result = Some(result.clone());
                job.failed_reason = None;
                job.finished_at = Some(finished_at);
                true
            }
            None => false,
        })
    }

    async fn schedule_retry(
        &self,
        job_id: &str,
        reason: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut table = guard(&self.table);
        Ok(match table.active_mut(job_id) {
            Some(job) => {
                job.state = JobState::Waiting;
                job.failed_reason = Some(reason.to_string());
                job.available_at = available_at;
                true
            }
            None => false,
        })
    }

    async fn fail(
        &self,
        job_id: &str,
        reason: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut table = guard(&self.table);
        Ok(match table.active_mut(job_id) {
            Some(job) => {
                job.state = JobState::Failed;
                job.failed_reason = Some(reason.to_string());
                job.finished_at = Some(finished_at);
                true
            }
            None => false,
        })
    }

    async fn reset_failed(
        &self,
        job_id: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut table = guard(&self.table);
        Ok(match table.jobs.get_mut(job_id) {
            Some((_, job)) if job.state == JobState::Failed => {
                job.state = JobState::Waiting;
                job.attempts_made = 0;
                job.progress = 0;
                job.failed_reason = None;
                job.finished_at = None;
                job.available_at = available_at;
                true
            }
            _ => false,
        })
    }

    async fn counts(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<JobCounts, RepositoryError> {
        let table = guard(&self.table);
        let mut counts = JobCounts::default();
        for (_, job) in table.jobs.values().filter(|(_, j)| j.queue == queue) {
            match job.state {
                JobState::Waiting if job.available_at > now => {
                    counts.waiting += 1;
                    counts.delayed += 1;
                }
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
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
        let mut table = guard(&self.table);
        let before = table.jobs.len();
        table.jobs.retain(|_, (_, job)| {
            !(job.queue == queue
                && job.state == state
                && job.finished_at.is_some_and(|t| t < older_than))
        });
        Ok((before - table.jobs.len()) as u64)
    }

    async fn requeue_active(&self, queue: QueueName) -> Result<u64, RepositoryError> {
        let mut table = guard(&self.table);
        let mut count = 0;
        for (_, job) in table.jobs.values_mut() {
            if job.queue == queue && job.state == JobState::Active {
                job.state = JobState::Waiting;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use stepwise_types::execution::{ExecutionStatus, TriggerSource};
    use stepwise_types::job::{JobData, JobPriority};

    fn job(queue: QueueName, priority: JobPriority) -> StoredJob {
        StoredJob::waiting(queue, JobData::new("estimation", json!({})).with_priority(priority))
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = MemoryJobStore::new();
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
            order.push(claimed.data.id);
        }
        assert_eq!(
            order,
            vec![high.data.id, medium_a.data.id, medium_b.data.id, low.data.id]
        );
    }

    #[tokio::test]
    async fn claim_skips_other_queues_and_delayed_jobs() {
        let store = MemoryJobStore::new();
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
    }

    #[tokio::test]
    async fn transitions_require_active_state() {
        let store = MemoryJobStore::new();
        let j = job(QueueName::AiAnalysis, JobPriority::Medium);
        store.insert(&j).await.unwrap();

        assert!(!store.complete(&j.data.id, &json!(1), Utc::now()).await.unwrap());
        store
            .claim_next(QueueName::AiAnalysis, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(store.complete(&j.data.id, &json!(1), Utc::now()).await.unwrap());
        assert!(!store.fail(&j.data.id, "late", Utc::now()).await.unwrap());

        let stored = store.get(&j.data.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn reset_failed_only_touches_failed_jobs() {
        let store = MemoryJobStore::new();
        let j = job(QueueName::AiAnalysis, JobPriority::Medium);
        store.insert(&j).await.unwrap();
        assert!(!store.reset_failed(&j.data.id, Utc::now()).await.unwrap());

        store
            .claim_next(QueueName::AiAnalysis, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        store.fail(&j.data.id, "boom", Utc::now()).await.unwrap();
        assert!(store.reset_failed(&j.data.id, Utc::now()).await.unwrap());

        let stored = store.get(&j.data.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts_made, 0);
        assert!(stored.failed_reason.is_none());
    }

    #[tokio::test]
    async fn clean_removes_only_old_jobs_in_state() {
        let store = MemoryJobStore::new();
        let j = job(QueueName::AiAnalysis, JobPriority::Medium);
        let pending = job(QueueName::AiAnalysis, JobPriority::Medium);
        store.insert(&j).await.unwrap();
        store
            .claim_next(QueueName::AiAnalysis, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        store
            .complete(&j.data.id, &json!(null), Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        store.insert(&pending).await.unwrap();

        let removed = store
            .clean(QueueName::AiAnalysis, JobState::Completed, Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&pending.data.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn executions_list_newest_first_and_unfinished() {
        let repo = MemoryExecutionRepository::new();
        let mut ids = Vec::new();
        for status in [ExecutionStatus::Completed, ExecutionStatus::Running] {
            let exec = WorkflowExecution {
                execution_id: Uuid::now_v7(),
                workflow_id: "wf".to_string(),
                status,
                input: json!({}),
                current_step: None,
                progress: 0,
                logs: vec![],
                result: None,
                error: None,
                steps: Default::default(),
                trigger: TriggerSource::Manual,
                retry_of: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            ids.push(exec.execution_id);
            repo.save_execution(&exec).await.unwrap();
        }

        let listed = repo.list_executions(Some("wf"), 10).await.unwrap();
        assert_eq!(listed[0].execution_id, ids[1]);
        assert_eq!(repo.list_unfinished().await.unwrap().len(), 1);
        assert!(repo.list_executions(Some("other"), 10).await.unwrap().is_empty());
    }
}
