//! Queue manager: the public face of the five named job queues.
//!
//! Owns one dispatcher loop per queue, routes progress reports back into the
//! store, and exposes enqueue, control, statistics, and hook registration.
//! Jobs are durable in the [`JobStore`]; the manager itself only holds
//! runtime state (pause flags, concurrency, hooks).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::event::{JobCompletedEvent, JobFailedEvent, JobProgressEvent, QueueEvent};
use stepwise_types::job::{
    JobData, JobPriority, JobState, JobStatus, QueueName, QueueStats, StoredJob, SystemStats,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::worker::{Dispatch, JobDispatcher, QueueRuntime, run_dispatcher};
use crate::event::{EventBus, Subscription};
use crate::repository::JobStore;

/// Errors from queue management operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("cannot clean jobs in non-terminal state '{0}'")]
    NonTerminalState(JobState),

    #[error("queue manager already started")]
    AlreadyStarted,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Manages the named queues on top of a durable job store.
pub struct QueueManager<S> {
    store: Arc<S>,
    queues: BTreeMap<QueueName, Arc<QueueRuntime>>,
    events: EventBus<QueueEvent>,
    poll_interval: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl<S: JobStore + 'static> QueueManager<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        let queues = QueueName::ALL
            .into_iter()
            .map(|name| {
                let runtime = QueueRuntime::new(name);
                if let Some(concurrency) = config.queue_concurrency(name) {
                    runtime.set_concurrency(concurrency);
                }
                (name, Arc::new(runtime))
            })
            .collect();

        Self {
            store,
            queues,
            events: EventBus::new(1024),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    fn runtime(&self, queue: QueueName) -> &Arc<QueueRuntime> {
        // Every queue name is inserted in `new`.
        &self.queues[&queue]
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Broadcast stream of every queue event.
    pub fn events(&self) -> &EventBus<QueueEvent> {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue a job. `priority` overrides the priority carried in the job options.
    pub async fn add_job(
        &self,
        queue: QueueName,
        mut job: JobData,
        priority: Option<JobPriority>,
    ) -> Result<String, QueueError> {
        if let Some(priority) = priority {
            job.options.priority = priority;
        }
        let job_id = job.id.clone();
        let stored = StoredJob::waiting(queue, job);
        self.store.insert(&stored).await?;

        tracing::debug!(
            %job_id,
            %queue,
            job_type = %stored.data.job_type,
            priority = ?stored.data.options.priority,
            "job added"
        );
        self.events.publish(QueueEvent::JobAdded {
            queue,
            job_id: job_id.clone(),
        });
        self.runtime(queue).wake();
        Ok(job_id)
    }

    /// Enqueue several jobs in order. Stops at the first storage error.
    pub async fn add_bulk_jobs(
        &self,
        queue: QueueName,
        jobs: Vec<JobData>,
    ) -> Result<Vec<String>, QueueError> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.add_job(queue, job, None).await?);
        }
        Ok(ids)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, QueueError> {
        Ok(self.store.get(job_id).await?.map(JobStatus::from))
    }

    /// Move a permanently failed job back to `waiting` with a fresh attempt
    /// budget. Returns `false` when the job is unknown or not failed.
    pub async fn retry_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(false);
        };
        if job.state != JobState::Failed {
            return Ok(false);
        }
        let reset = self.store.reset_failed(job_id, Utc::now()).await?;
        if reset {
            tracing::info!(%job_id, queue = %job.queue, "failed job re-queued");
            self.runtime(job.queue).wake();
        }
        Ok(reset)
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Stop claiming new jobs on `queue`. Active jobs run to completion.
    pub fn pause_queue(&self, queue: QueueName) {
        self.runtime(queue).set_paused(true);
        self.events.publish(QueueEvent::QueuePaused { queue });
        tracing::info!(%queue, "queue paused");
    }

    pub fn resume_queue(&self, queue: QueueName) {
        self.runtime(queue).set_paused(false);
        self.events.publish(QueueEvent::QueueResumed { queue });
        tracing::info!(%queue, "queue resumed");
    }

    pub fn is_paused(&self, queue: QueueName) -> bool {
        self.runtime(queue).is_paused()
    }

    /// Delete `state` jobs of `queue` that finished more than `grace` ago.
    pub async fn clean_queue(
        &self,
        queue: QueueName,
        grace: Duration,
        state: JobState,
    ) -> Result<u64, QueueError> {
        if !state.is_terminal() {
            return Err(QueueError::NonTerminalState(state));
        }
        let older_than =
            Utc::now() - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let removed = self.store.clean(queue, state, older_than).await?;
        tracing::info!(%queue, %state, removed, "queue cleaned");
        Ok(removed)
    }

    /// Set the worker concurrency of a queue. Only allowed before [`start`](Self::start).
    pub fn set_concurrency(&self, queue: QueueName, concurrency: usize) -> Result<(), QueueError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }
        self.runtime(queue).set_concurrency(concurrency);
        Ok(())
    }

    pub fn concurrency(&self, queue: QueueName) -> usize {
        self.runtime(queue).concurrency()
    }

    // -----------------------------------------------------------------------
    // Statistics and health
    // -----------------------------------------------------------------------

    pub async fn get_queue_stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        let counts = self.store.counts(queue, Utc::now()).await?;
        let runtime = self.runtime(queue);
        Ok(QueueStats {
            queue,
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            paused: runtime.is_paused(),
            concurrency: runtime.concurrency(),
        })
    }

    pub async fn get_system_stats(&self) -> Result<SystemStats, QueueError> {
        let mut queues = Vec::with_capacity(self.queues.len());
        for queue in QueueName::ALL {
            queues.push(self.get_queue_stats(queue).await?);
        }
        Ok(SystemStats {
            total_waiting: queues.iter().map(|q| q.waiting).sum(),
            total_active: queues.iter().map(|q| q.active).sum(),
            total_completed: queues.iter().map(|q| q.completed).sum(),
            total_failed: queues.iter().map(|q| q.failed).sum(),
            healthy: self.is_healthy().await,
            queues,
        })
    }

    /// The store answers and, once started, every dispatcher loop is running.
    pub async fn is_healthy(&self) -> bool {
        if let Err(e) = self.store.ping().await {
            tracing::warn!(error = %e, "job store health check failed");
            return false;
        }
        if self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            return self.queues.values().all(|q| q.is_alive());
        }
        true
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    pub fn on_job_progress<F>(&self, queue: QueueName, callback: F) -> Subscription
    where
        F: Fn(&JobProgressEvent) + Send + Sync + 'static,
    {
        self.runtime(queue).progress_hooks.subscribe(callback)
    }

    pub fn on_job_completed<F>(&self, queue: QueueName, callback: F) -> Subscription
    where
        F: Fn(&JobCompletedEvent) + Send + Sync + 'static,
    {
        self.runtime(queue).completed_hooks.subscribe(callback)
    }

    /// Fires after every failed attempt; check `will_retry` for permanence.
    pub fn on_job_failed<F>(&self, queue: QueueName, callback: F) -> Subscription
    where
        F: Fn(&JobFailedEvent) + Send + Sync + 'static,
    {
        self.runtime(queue).failed_hooks.subscribe(callback)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover jobs left active by a previous process and start one
    /// dispatcher loop per queue.
    pub async fn start(&self, dispatcher: Arc<dyn JobDispatcher>) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        for queue in QueueName::ALL {
            let requeued = self.store.requeue_active(queue).await?;
            if requeued > 0 {
                tracing::warn!(%queue, requeued, "recovered jobs left active by a previous run");
            }
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        self.tracker.spawn(drain_progress(
            Arc::clone(&self.store),
            self.queues.clone(),
            self.events.clone(),
            progress_rx,
            self.cancel.clone(),
        ));

        let dispatch = Dispatch {
            store: Arc::clone(&self.store),
            dispatcher,
            events: self.events.clone(),
            progress_tx,
            poll_interval: self.poll_interval,
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        };
        for runtime in self.queues.values() {
            self.tracker
                .spawn(run_dispatcher(Arc::clone(runtime), dispatch.clone()));
        }

        tracing::info!(queues = self.queues.len(), "queue manager started");
        Ok(())
    }

    /// Stop claiming jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("queue manager stopped");
    }
}

/// Persist progress reports and fan them out to hooks and the event bus.
async fn drain_progress<S: JobStore>(
    store: Arc<S>,
    queues: BTreeMap<QueueName, Arc<QueueRuntime>>,
    events: EventBus<QueueEvent>,
    mut rx: mpsc::UnboundedReceiver<JobProgressEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match store.update_progress(&event.job_id, event.progress).await {
            Ok(true) => {
                if let Some(runtime) = queues.get(&event.queue) {
                    runtime.progress_hooks.emit(&event);
                }
                events.publish(QueueEvent::JobProgress(event));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "failed to record job progress");
            }
        }
    }
}
