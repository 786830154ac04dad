//! Processor registry: job type -> (queue, handler).
//!
//! The registry is the [`JobDispatcher`] handed to the queue manager. It
//! checks that a job arrived on the queue its type is bound to, then runs the
//! handler with panics converted into retryable failures.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use stepwise_types::job::{JobData, QueueName};

use super::ProcessorError;
use crate::queue::{JobContext, JobDispatcher, QueueManager};
use crate::repository::JobStore;

/// A job handler: `(job, ctx) -> result`.
pub type ProcessorFn = Arc<
    dyn Fn(JobData, JobContext) -> BoxFuture<'static, Result<serde_json::Value, ProcessorError>>
        + Send
        + Sync,
>;

/// Binds a job type to a queue and a handler.
#[derive(Clone)]
pub struct ProcessorRegistration {
    /// Job type this handler serves.
    pub name: String,
    pub queue_name: QueueName,
    /// Requested worker concurrency for the queue.
    pub concurrency: Option<usize>,
    pub processor: ProcessorFn,
}

impl std::fmt::Debug for ProcessorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistration")
            .field("name", &self.name)
            .field("queue_name", &self.queue_name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Registry of job handlers, indexed by job type.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, ProcessorRegistration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same job type replaces
    /// the earlier one.
    pub fn register_processor(&mut self, registration: ProcessorRegistration) {
        tracing::debug!(
            job_type = %registration.name,
            queue = %registration.queue_name,
            "processor registered"
        );
        self.processors
            .insert(registration.name.clone(), registration);
    }

    pub fn get(&self, job_type: &str) -> Option<&ProcessorRegistration> {
        self.processors.get(job_type)
    }

    /// Registered job types, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Apply registered concurrency to queues that have no configured value.
    ///
    /// When several processors share a queue, the largest request wins. Must
    /// run before the manager starts.
    pub fn apply_concurrency<S: JobStore + 'static>(
        &self,
        manager: &QueueManager<S>,
        configured: impl Fn(QueueName) -> Option<usize>,
    ) {
        for queue in QueueName::ALL {
            if configured(queue).is_some() {
                continue;
            }
            let requested = self
                .processors
                .values()
                .filter(|r| r.queue_name == queue)
                .filter_map(|r| r.concurrency)
                .max();
            if let Some(concurrency) = requested {
                if let Err(e) = manager.set_concurrency(queue, concurrency) {
                    tracing::warn!(%queue, error = %e, "processor concurrency not applied");
                }
            }
        }
    }
}

impl JobDispatcher for ProcessorRegistry {
    fn dispatch(
        &self,
        job: JobData,
        ctx: JobContext,
    ) -> BoxFuture<'static, Result<serde_json::Value, ProcessorError>> {
        let Some(registration) = self.processors.get(&job.job_type) else {
            let job_type = job.job_type;
            return Box::pin(async move { Err(ProcessorError::NoProcessor(job_type)) });
        };

        if registration.queue_name != ctx.queue() {
            let err = ProcessorError::WrongQueue {
                job_type: job.job_type,
                expected: registration.queue_name.to_string(),
                actual: ctx.queue().to_string(),
            };
            return Box::pin(async move { Err(err) });
        }

        let processor = Arc::clone(&registration.processor);
        Box::pin(async move {
            // Building the future can panic too, so it runs inside the guarded block.
            let run = async move { processor(job, ctx).await };
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(ProcessorError::Panicked(panic_message(panic.as_ref()))),
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
