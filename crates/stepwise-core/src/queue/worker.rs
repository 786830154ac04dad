//! Per-queue dispatcher loop and single-job execution.
//!
//! The loop acquires a concurrency permit, claims the best ready job from the
//! store, and spawns it. The spawned task runs the handler under the job's
//! timeout, then records exactly one outcome: completed, waiting (retry with
//! backoff), or failed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use stepwise_types::config::DEFAULT_QUEUE_CONCURRENCY;
use stepwise_types::event::{JobCompletedEvent, JobFailedEvent, JobProgressEvent, QueueEvent};
use stepwise_types::job::{JobData, QueueName, StoredJob};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::event::{EventBus, HookRegistry};
use crate::processor::ProcessorError;
use crate::repository::JobStore;
use crate::workflow::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Dispatcher seam
// ---------------------------------------------------------------------------

/// Runs the handler for one claimed job.
///
/// Implemented by [`ProcessorRegistry`](crate::processor::ProcessorRegistry).
pub trait JobDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        job: JobData,
        ctx: JobContext,
    ) -> BoxFuture<'static, Result<serde_json::Value, ProcessorError>>;
}

/// What a handler knows about the job it is running.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    job_type: String,
    queue: QueueName,
    attempt: u32,
    progress: Option<mpsc::UnboundedSender<JobProgressEvent>>,
}

impl JobContext {
    /// A context whose progress reports go nowhere.
    pub fn detached(job: &JobData, queue: QueueName, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            queue,
            attempt,
            progress: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record progress (clamped to 100) and fire `on_job_progress`.
    pub fn report_progress(&self, progress: u8) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(JobProgressEvent {
                queue: self.queue,
                job_id: self.job_id.clone(),
                job_type: self.job_type.clone(),
                progress: progress.min(100),
            });
        }
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-queue runtime state
// ---------------------------------------------------------------------------

/// Shared state of one named queue.
pub(crate) struct QueueRuntime {
    pub(crate) name: QueueName,
    concurrency: AtomicUsize,
    paused: AtomicBool,
    /// Signalled on enqueue, resume, and freed worker slots.
    wake: Notify,
    alive: AtomicBool,
    pub(crate) progress_hooks: HookRegistry<JobProgressEvent>,
    pub(crate) completed_hooks: HookRegistry<JobCompletedEvent>,
    pub(crate) failed_hooks: HookRegistry<JobFailedEvent>,
}

impl QueueRuntime {
    pub(crate) fn new(name: QueueName) -> Self {
        Self {
            name,
            concurrency: AtomicUsize::new(DEFAULT_QUEUE_CONCURRENCY),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            alive: AtomicBool::new(false),
            progress_hooks: HookRegistry::new("job_progress"),
            completed_hooks: HookRegistry::new("job_completed"),
            failed_hooks: HookRegistry::new("job_failed"),
        }
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    pub(crate) fn set_concurrency(&self, concurrency: usize) {
        self.concurrency.store(concurrency.max(1), Ordering::Relaxed);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        if !paused {
            self.wake.notify_one();
        }
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher loop
// ---------------------------------------------------------------------------

/// Everything a dispatcher loop and its job tasks share.
pub(crate) struct Dispatch<S> {
    pub(crate) store: Arc<S>,
    pub(crate) dispatcher: Arc<dyn JobDispatcher>,
    pub(crate) events: EventBus<QueueEvent>,
    pub(crate) progress_tx: mpsc::UnboundedSender<JobProgressEvent>,
    pub(crate) poll_interval: Duration,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl<S> Clone for Dispatch<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatcher: Arc::clone(&self.dispatcher),
            events: self.events.clone(),
            progress_tx: self.progress_tx.clone(),
            poll_interval: self.poll_interval,
            cancel: self.cancel.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<S: JobStore + 'static> Dispatch<S> {
    /// Sleep until woken, the poll interval elapses, or shutdown. Returns
    /// `false` on shutdown.
    async fn idle(&self, queue: &QueueRuntime) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = queue.wake.notified() => true,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

/// Claim and spawn jobs for one queue until shutdown.
pub(crate) async fn run_dispatcher<S: JobStore + 'static>(
    queue: Arc<QueueRuntime>,
    dispatch: Dispatch<S>,
) {
    let semaphore = Arc::new(Semaphore::new(queue.concurrency()));
    queue.alive.store(true, Ordering::SeqCst);
    tracing::debug!(queue = %queue.name, concurrency = queue.concurrency(), "dispatcher started");

    loop {
        if queue.is_paused() {
            if !dispatch.idle(&queue).await {
                break;
            }
            continue;
        }

        let permit = tokio::select! {
            _ = dispatch.cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // Pausing while waiting for a slot must still hold back new claims.
        if queue.is_paused() {
            continue;
        }

        match dispatch.store.claim_next(queue.name, Utc::now()).await {
            Ok(Some(job)) => {
                let queue = Arc::clone(&queue);
                let dispatch_job = dispatch.clone();
                dispatch
                    .tracker
                    .spawn(run_job(job, permit, queue, dispatch_job));
            }
            Ok(None) => {
                drop(permit);
                if !dispatch.idle(&queue).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                tracing::error!(queue = %queue.name, error = %e, "failed to claim job");
                if !dispatch.idle(&queue).await {
                    break;
                }
            }
        }
    }

    queue.alive.store(false, Ordering::SeqCst);
    tracing::debug!(queue = %queue.name, "dispatcher stopped");
}

/// Run one claimed job to a recorded outcome.
async fn run_job<S: JobStore + 'static>(
    job: StoredJob,
    _permit: OwnedSemaphorePermit,
    queue: Arc<QueueRuntime>,
    dispatch: Dispatch<S>,
) {
    let job_id = job.data.id.clone();
    let attempt = job.attempts_made;
    dispatch.events.publish(QueueEvent::JobActive {
        queue: queue.name,
        job_id: job_id.clone(),
        attempt,
    });
    tracing::debug!(%job_id, queue = %queue.name, job_type = %job.data.job_type, attempt, "dispatching job");

    let ctx = JobContext {
        job_id: job_id.clone(),
        job_type: job.data.job_type.clone(),
        queue: queue.name,
        attempt,
        progress: Some(dispatch.progress_tx.clone()),
    };
    let handler = dispatch.dispatcher.dispatch(job.data.clone(), ctx);
    let outcome = match job.data.options.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), handler)
            .await
            .unwrap_or(Err(ProcessorError::Timeout(ms))),
        None => handler.await,
    };

    match outcome {
        Ok(result) => record_completion(&job, result, &queue, &dispatch).await,
        Err(err) => record_failure(&job, err, &queue, &dispatch).await,
    }

    queue.wake();
}

async fn record_completion<S: JobStore>(
    job: &StoredJob,
    result: serde_json::Value,
    queue: &QueueRuntime,
    dispatch: &Dispatch<S>,
) {
    let job_id = &job.data.id;
    match dispatch.store.complete(job_id, &result, Utc::now()).await {
        Ok(true) => {
            tracing::debug!(%job_id, queue = %queue.name, "job completed");
            let event = JobCompletedEvent {
                queue: queue.name,
                job_id: job_id.clone(),
                job_type: job.data.job_type.clone(),
                result,
                attempts_made: job.attempts_made,
            };
            queue.completed_hooks.emit(&event);
            dispatch.events.publish(QueueEvent::JobCompleted(event));
        }
        Ok(false) => {
            tracing::warn!(%job_id, queue = %queue.name, "job no longer active; completion dropped");
        }
        Err(e) => {
            tracing::error!(%job_id, queue = %queue.name, error = %e, "failed to record job completion");
        }
    }
}

async fn record_failure<S: JobStore>(
    job: &StoredJob,
    err: ProcessorError,
    queue: &QueueRuntime,
    dispatch: &Dispatch<S>,
) {
    let job_id = &job.data.id;
    let reason = err.to_string();
    let policy = &job.data.options.retry;
    let will_retry = err.is_retryable() && RetryHandler::should_retry(policy, job.attempts_made);

    let recorded = if will_retry {
        let delay = RetryHandler::delay_for_attempt(policy, job.attempts_made);
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::warn!(
            %job_id,
            queue = %queue.name,
            attempt = job.attempts_made,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "job failed; retrying"
        );
        dispatch.store.schedule_retry(job_id, &reason, available_at).await
    } else {
        tracing::warn!(
            %job_id,
            queue = %queue.name,
            attempts = job.attempts_made,
            error = %reason,
            "job failed permanently"
        );
        dispatch.store.fail(job_id, &reason, Utc::now()).await
    };

    match recorded {
        Ok(true) => {
            let event = JobFailedEvent {
                queue: queue.name,
                job_id: job_id.clone(),
                job_type: job.data.job_type.clone(),
                reason,
                attempts_made: job.attempts_made,
                will_retry,
            };
            queue.failed_hooks.emit(&event);
            dispatch.events.publish(QueueEvent::JobFailed(event));
        }
        Ok(false) => {
            tracing::warn!(%job_id, queue = %queue.name, "job no longer active; failure dropped");
        }
        Err(e) => {
            tracing::error!(%job_id, queue = %queue.name, error = %e, "failed to record job failure");
        }
    }
}
