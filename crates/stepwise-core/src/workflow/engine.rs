//! Workflow engine: definition management, execution sequencing, control,
//! and metrics.
//!
//! The engine is the single sequencer for step ordering. It enqueues every
//! ready step as a job, listens to the queue manager's completion and failure
//! hooks through an mpsc channel, and drains that channel on one task. All
//! execution state sits behind one async mutex, held across enqueue so a job's
//! outcome is never processed before its id has been recorded.
//!
//! # Execution flow
//!
//! 1. Load the definition, compute the execution plan (rejects cycles).
//! 2. Create the execution (`pending -> running`) and enqueue root steps.
//! 3. On each job outcome, update the step, then enqueue newly ready steps.
//! 4. When nothing is left, finish the execution and wake synchronous callers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::event::{DefinitionChange, WorkflowEvent};
use stepwise_types::execution::{
    ExecutionStatus, SystemMetrics, TriggerSource, WorkflowExecution, WorkflowMetrics,
    WorkflowResult,
};
use stepwise_types::job::{JobData, JobPriority, QueueName, RetryPolicy};
use stepwise_types::workflow::{StepDefinition, ValidationReport, WorkflowDefinition};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::dag::build_execution_plan;
use super::definition::{DefinitionError, DefinitionStore, validate_definition};
use super::metrics;
use super::state::{ExecutionState, Transition};
use crate::event::{EventBus, HookRegistry, Subscription};
use crate::processor::builtin::StepJobPayload;
use crate::queue::{QueueError, QueueManager};
use crate::repository::{DefinitionRepository, ExecutionRepository, JobStore};
use crate::trigger::{LaunchError, WorkflowLauncher};

/// Reason recorded on executions found unfinished at startup.
pub const INTERRUPTED_REASON: &str = "interrupted by engine restart";

/// Upper bound on executions read for metrics.
const METRICS_HISTORY_LIMIT: u32 = 100_000;

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow validation failed: {}", .0.errors.join("; "))]
    Validation(ValidationReport),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    #[error("workflow '{0}' already exists")]
    AlreadyExists(String),

    #[error("execution {0} timed out and was cancelled")]
    ExecutionTimeout(Uuid),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Options for [`WorkflowEngine::execute_workflow`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cancel the execution and return `ExecutionTimeout` after this long.
    pub timeout: Option<Duration>,
    /// Job priority for steps that do not set their own.
    pub priority: Option<JobPriority>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// A job outcome forwarded from the queue manager's hooks.
#[derive(Debug)]
enum StepSignal {
    Completed {
        job_id: String,
        result: Value,
        attempts: u32,
    },
    Failed {
        job_id: String,
        reason: String,
        attempts: u32,
        will_retry: bool,
    },
}

/// Job options applied to steps that do not set their own.
#[derive(Debug, Clone)]
struct StepDefaults {
    retry: RetryPolicy,
    timeout_ms: Option<u64>,
    priority: Option<JobPriority>,
    /// Cap on steps queued at once for one execution.
    max_outstanding: Option<usize>,
}

struct Run {
    state: ExecutionState,
    defaults: StepDefaults,
    waiters: Vec<oneshot::Sender<WorkflowExecution>>,
}

#[derive(Default)]
struct EngineState {
    runs: HashMap<Uuid, Run>,
    /// job id -> (execution id, step id) for every outstanding step job.
    jobs: HashMap<String, (Uuid, String)>,
}

struct WorkflowHooks {
    start: HookRegistry<WorkflowExecution>,
    progress: HookRegistry<WorkflowExecution>,
    complete: HookRegistry<WorkflowExecution>,
    error: HookRegistry<WorkflowExecution>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine<D, X, S> {
    definitions: DefinitionStore<D>,
    /// Serializes create/update/delete so existence checks stay valid.
    definition_lock: Mutex<()>,
    executions: Arc<X>,
    queue: Arc<QueueManager<S>>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    hooks: WorkflowHooks,
    events: EventBus<WorkflowEvent>,
    definition_events: EventBus<DefinitionChange>,
    signals: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StepSignal>>>,
    _queue_subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<D, X, S> WorkflowEngine<D, X, S>
where
    D: DefinitionRepository + 'static,
    X: ExecutionRepository + 'static,
    S: JobStore + 'static,
{
    pub fn new(
        definitions: D,
        executions: Arc<X>,
        queue: Arc<QueueManager<S>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::with_capacity(QueueName::ALL.len() * 2);
        for name in QueueName::ALL {
            let completed = tx.clone();
            subscriptions.push(queue.on_job_completed(name, move |e| {
                let _ = completed.send(StepSignal::Completed {
                    job_id: e.job_id.clone(),
                    result: e.result.clone(),
                    attempts: e.attempts_made,
                });
            }));
            let failed = tx.clone();
            subscriptions.push(queue.on_job_failed(name, move |e| {
                let _ = failed.send(StepSignal::Failed {
                    job_id: e.job_id.clone(),
                    reason: e.reason.clone(),
                    attempts: e.attempts_made,
                    will_retry: e.will_retry,
                });
            }));
        }

        Arc::new(Self {
            definitions: DefinitionStore::new(definitions),
            definition_lock: Mutex::new(()),
            executions,
            queue,
            config,
            state: Mutex::new(EngineState::default()),
            hooks: WorkflowHooks {
                start: HookRegistry::new("workflow_start"),
                progress: HookRegistry::new("workflow_progress"),
                complete: HookRegistry::new("workflow_complete"),
                error: HookRegistry::new("workflow_error"),
            },
            events: EventBus::new(1024),
            definition_events: EventBus::new(256),
            signals: std::sync::Mutex::new(Some(rx)),
            _queue_subscriptions: subscriptions,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn queue(&self) -> &Arc<QueueManager<S>> {
        &self.queue
    }

    pub fn definitions(&self) -> &DefinitionStore<D> {
        &self.definitions
    }

    /// Lifecycle events of every execution.
    pub fn events(&self) -> &EventBus<WorkflowEvent> {
        &self.events
    }

    /// Created/updated/deleted definitions, for trigger resync.
    pub fn definition_events(&self) -> &EventBus<DefinitionChange> {
        &self.definition_events
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Fail executions left unfinished by a previous process and start the
    /// sequencer task. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let receiver = self
            .signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut receiver) = receiver else {
            return Ok(());
        };

        let owned: HashSet<Uuid> = self.state.lock().await.runs.keys().copied().collect();
        for execution in self.executions.list_unfinished().await? {
            if owned.contains(&execution.execution_id) {
                continue;
            }
            let mut interrupted = ExecutionState::from_execution(execution);
            interrupted.abort(INTERRUPTED_REASON);
            let execution = interrupted.into_execution();
            self.executions.save_execution(&execution).await?;
            tracing::warn!(
                execution_id = %execution.execution_id,
                workflow_id = %execution.workflow_id,
                "execution interrupted by restart marked failed"
            );
        }

        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = receiver.recv() => match signal {
                        Some(signal) => engine.handle_signal(signal).await,
                        None => break,
                    },
                }
            }
        });

        tracing::info!("workflow engine started");
        Ok(())
    }

    /// Stop the sequencer. Synchronous callers still waiting get `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let mut state = self.state.lock().await;
        for run in state.runs.values_mut() {
            run.waiters.clear();
        }
        tracing::info!("workflow engine stopped");
    }

    // -----------------------------------------------------------------------
    // Definition management
    // -----------------------------------------------------------------------

    pub fn validate_workflow(&self, def: &WorkflowDefinition) -> ValidationReport {
        validate_definition(def)
    }

    fn ensure_valid(def: &WorkflowDefinition) -> Result<(), EngineError> {
        let report = validate_definition(def);
        if report.valid {
            Ok(())
        } else {
            Err(EngineError::Validation(report))
        }
    }

    /// Store a new definition. Rejects invalid definitions and duplicate ids.
    pub async fn create_workflow(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        Self::ensure_valid(&def)?;
        let _guard = self.definition_lock.lock().await;
        if self.definitions.load_one(&def.id).await?.is_some() {
            return Err(EngineError::AlreadyExists(def.id));
        }
        let now = Utc::now();
        def.created_at = Some(now);
        def.updated_at = Some(now);
        self.definitions.save_one(def.clone()).await?;

        tracing::info!(workflow_id = %def.id, steps = def.steps.len(), "workflow created");
        self.definition_events.publish(DefinitionChange::Created {
            workflow: def.clone(),
        });
        Ok(def)
    }

    /// Replace an existing definition, keeping its `created_at`.
    pub async fn update_workflow(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        Self::ensure_valid(&def)?;
        let _guard = self.definition_lock.lock().await;
        let Some(existing) = self.definitions.load_one(&def.id).await? else {
            return Err(EngineError::WorkflowNotFound(def.id));
        };
        def.created_at = existing.created_at.or(def.created_at);
        def.updated_at = Some(Utc::now());
        self.definitions.save_one(def.clone()).await?;

        tracing::info!(workflow_id = %def.id, "workflow updated");
        self.definition_events.publish(DefinitionChange::Updated {
            workflow: def.clone(),
        });
        Ok(def)
    }

    /// Returns whether the definition existed.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, EngineError> {
        let _guard = self.definition_lock.lock().await;
        let deleted = self.definitions.delete(workflow_id).await?;
        if deleted {
            tracing::info!(%workflow_id, "workflow deleted");
            self.definition_events.publish(DefinitionChange::Deleted {
                workflow_id: workflow_id.to_string(),
            });
        }
        Ok(deleted)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        Ok(self.definitions.load().await?)
    }

    pub async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        Ok(self.definitions.load_one(workflow_id).await?)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a workflow and wait for it to finish.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<WorkflowResult, EngineError> {
        let (tx, rx) = oneshot::channel();
        let execution_id = self
            .launch_execution(
                workflow_id,
                input,
                TriggerSource::Manual,
                None,
                options.priority,
                Some(tx),
            )
            .await?;

        let finished = match options.timeout {
            None => rx.await.map_err(|_| EngineError::ShuttingDown)?,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(finished) => finished.map_err(|_| EngineError::ShuttingDown)?,
                Err(_) => {
                    let reason = format!("timed out after {}ms", limit.as_millis());
                    self.cancel_execution(execution_id, &reason).await;
                    return Err(EngineError::ExecutionTimeout(execution_id));
                }
            },
        };
        Ok(WorkflowResult::from(&finished))
    }

    /// Start a workflow and return its execution id without waiting.
    pub async fn execute_workflow_async(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> Result<Uuid, EngineError> {
        self.launch_execution(workflow_id, input, TriggerSource::Manual, None, None, None)
            .await
    }

    async fn launch_execution(
        &self,
        workflow_id: &str,
        input: Value,
        trigger: TriggerSource,
        retry_of: Option<Uuid>,
        priority: Option<JobPriority>,
        waiter: Option<oneshot::Sender<WorkflowExecution>>,
    ) -> Result<Uuid, EngineError> {
        let document = self.definitions.load_document().await?;
        let settings = document.settings.clone().unwrap_or_default();
        let Some(def) = document.workflows.into_iter().find(|w| w.id == workflow_id) else {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        };
        if !def.enabled {
            return Err(EngineError::WorkflowDisabled(def.id));
        }
        // The stored file may have been edited by hand.
        Self::ensure_valid(&def)?;
        let waves = build_execution_plan(&def.steps)?.len();

        let mut retry = self.config.default_retry.clone();
        if let Some(max_retries) = settings.max_retries {
            retry.max_retries = max_retries;
        }
        let defaults = StepDefaults {
            retry,
            timeout_ms: settings.default_timeout.or(self.config.default_job_timeout_ms),
            priority,
            max_outstanding: settings.concurrency.filter(|n| *n > 0),
        };

        let mut execution = ExecutionState::new(&def, input, trigger, retry_of);
        execution.start();
        let execution_id = execution.execution_id();
        let mut events = vec![WorkflowEvent::ExecutionStarted {
            execution: execution.execution().clone(),
        }];
        tracing::info!(
            %workflow_id,
            %execution_id,
            %trigger,
            steps = def.steps.len(),
            waves,
            "execution started"
        );

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.runs.insert(
                execution_id,
                Run {
                    state: execution,
                    defaults,
                    waiters: waiter.into_iter().collect(),
                },
            );
            self.enqueue_ready(state, execution_id).await;
            self.settle_run(state, execution_id, &mut events).await;
        }

        self.publish(events);
        Ok(execution_id)
    }

    /// Enqueue the ready steps of a running execution, up to its cap on
    /// outstanding steps.
    async fn enqueue_ready(&self, state: &mut EngineState, execution_id: Uuid) {
        let ready = match state.runs.get(&execution_id) {
            Some(run) => {
                let ready = run.state.ready_steps();
                match run.defaults.max_outstanding {
                    Some(max) => {
                        let outstanding = run.state.outstanding_jobs().len();
                        ready
                            .into_iter()
                            .take(max.saturating_sub(outstanding))
                            .collect()
                    }
                    None => ready,
                }
            }
            None => return,
        };

        for step in ready {
            let Some(run) = state.runs.get_mut(&execution_id) else {
                return;
            };
            if run.state.is_terminal() {
                return;
            }

            let enqueued = match step_job(run, &step) {
                Ok(job) => self
                    .queue
                    .add_job(step.queue(), job, None)
                    .await
                    .map_err(|e| format!("failed to enqueue: {e}")),
                Err(e) => Err(e),
            };
            match enqueued {
                Ok(job_id) => {
                    tracing::debug!(%execution_id, step_id = %step.id, %job_id, "step enqueued");
                    run.state.mark_queued(&step.id, &job_id);
                    state.jobs.insert(job_id, (execution_id, step.id.clone()));
                }
                Err(reason) => {
                    tracing::error!(%execution_id, step_id = %step.id, error = %reason, "step could not be enqueued");
                    run.state.on_step_failed(&step.id, &reason, 0);
                }
            }
        }
    }

    /// Persist a run and, once it is terminal, retire it and wake its waiters.
    async fn settle_run(
        &self,
        state: &mut EngineState,
        execution_id: Uuid,
        events: &mut Vec<WorkflowEvent>,
    ) {
        let Some(run) = state.runs.get(&execution_id) else {
            return;
        };
        self.persist(run.state.execution()).await;
        if !run.state.is_terminal() {
            return;
        }

        let Some(run) = state.runs.remove(&execution_id) else {
            return;
        };
        let snapshot = run.state.execution().clone();
        for waiter in run.waiters {
            let _ = waiter.send(snapshot.clone());
        }

        match snapshot.status {
            ExecutionStatus::Completed => {
                tracing::info!(
                    %execution_id,
                    workflow_id = %snapshot.workflow_id,
                    duration_ms = snapshot.duration_ms().unwrap_or_default(),
                    "execution completed"
                );
                events.push(WorkflowEvent::ExecutionCompleted { execution: snapshot });
            }
            ExecutionStatus::Failed => {
                tracing::info!(
                    %execution_id,
                    workflow_id = %snapshot.workflow_id,
                    error = snapshot.error.as_deref().unwrap_or_default(),
                    "execution failed"
                );
                events.push(WorkflowEvent::ExecutionFailed { execution: snapshot });
            }
            _ => {
                tracing::info!(%execution_id, workflow_id = %snapshot.workflow_id, "execution cancelled");
                events.push(WorkflowEvent::ExecutionCancelled { execution: snapshot });
            }
        }
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.executions.save_execution(execution).await {
            tracing::error!(
                execution_id = %execution.execution_id,
                error = %e,
                "failed to persist execution"
            );
        }
    }

    /// Apply one job outcome.
    async fn handle_signal(&self, signal: StepSignal) {
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let (job_id, completed) = match signal {
                StepSignal::Failed {
                    job_id,
                    reason,
                    attempts,
                    will_retry: true,
                } => {
                    let Some((execution_id, step_id)) = state.jobs.get(&job_id).cloned() else {
                        return;
                    };
                    if let Some(run) = state.runs.get_mut(&execution_id) {
                        run.state.on_attempt_failed(&step_id, &reason, attempts);
                        self.persist(run.state.execution()).await;
                    }
                    return;
                }
                StepSignal::Failed {
                    job_id,
                    reason,
                    attempts,
                    will_retry: false,
                } => (job_id, Err((reason, attempts))),
                StepSignal::Completed {
                    job_id,
                    result,
                    attempts,
                } => (job_id, Ok((result, attempts))),
            };

            let Some((execution_id, step_id)) = state.jobs.remove(&job_id) else {
                return;
            };
            let Some(run) = state.runs.get_mut(&execution_id) else {
                tracing::debug!(%execution_id, %step_id, %job_id, "result for finished execution discarded");
                return;
            };

            let step_completed = completed.is_ok();
            let transition = match completed {
                Ok((result, attempts)) => run.state.on_step_completed(&step_id, result, attempts),
                Err((reason, attempts)) => run.state.on_step_failed(&step_id, &reason, attempts),
            };

            match transition {
                Transition::Discarded => return,
                Transition::Progressed => {
                    if step_completed {
                        events.push(WorkflowEvent::ExecutionProgress {
                            execution: run.state.execution().clone(),
                        });
                    }
                    self.enqueue_ready(state, execution_id).await;
                }
                Transition::Completed | Transition::Failed => {}
            }
            self.settle_run(state, execution_id, &mut events).await;
        }
        self.publish(events);
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Hold newly ready steps. Returns `false` for unknown or non-running executions.
    pub async fn pause_workflow(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(run) = state.runs.get_mut(&execution_id) else {
                return Ok(false);
            };
            if !run.state.pause() {
                return Ok(false);
            }
            let snapshot = run.state.execution().clone();
            self.persist(&snapshot).await;
            snapshot
        };
        tracing::info!(%execution_id, workflow_id = %snapshot.workflow_id, "execution paused");
        self.publish(vec![WorkflowEvent::ExecutionPaused { execution: snapshot }]);
        Ok(true)
    }

    /// Resume a paused execution and enqueue whatever became ready meanwhile.
    pub async fn resume_workflow(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(run) = state.runs.get_mut(&execution_id) else {
                return Ok(false);
            };
            if !run.state.resume() {
                return Ok(false);
            }
            tracing::info!(%execution_id, workflow_id = %run.state.execution().workflow_id, "execution resumed");
            events.push(WorkflowEvent::ExecutionResumed {
                execution: run.state.execution().clone(),
            });
            self.enqueue_ready(state, execution_id).await;
            self.settle_run(state, execution_id, &mut events).await;
        }
        self.publish(events);
        Ok(true)
    }

    /// Cancel an execution. Jobs already dispatched run on; their results are
    /// discarded and nothing further is enqueued.
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.cancel_execution(execution_id, "cancelled by user").await)
    }

    async fn cancel_execution(&self, execution_id: Uuid, reason: &str) -> bool {
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(run) = state.runs.get_mut(&execution_id) else {
                return false;
            };
            if !run.state.cancel(reason) {
                return false;
            }
            let outstanding = run.state.outstanding_jobs().len();
            tracing::debug!(%execution_id, outstanding, "jobs left running after cancel");
            self.settle_run(state, execution_id, &mut events).await;
        }
        self.publish(events);
        true
    }

    /// Re-run a failed execution's workflow with the same input.
    ///
    /// Returns the new execution id, or `None` when the execution is unknown
    /// or did not fail.
    pub async fn retry_workflow(&self, execution_id: Uuid) -> Result<Option<Uuid>, EngineError> {
        let Some(previous) = self.get_execution(execution_id).await? else {
            return Ok(None);
        };
        if previous.status != ExecutionStatus::Failed {
            return Ok(None);
        }
        let retried = self
            .launch_execution(
                &previous.workflow_id,
                previous.input.clone(),
                TriggerSource::Retry,
                Some(execution_id),
                None,
                None,
            )
            .await?;
        tracing::info!(%execution_id, retry = %retried, "execution retried");
        Ok(Some(retried))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        {
            let state = self.state.lock().await;
            if let Some(run) = state.runs.get(&execution_id) {
                return Ok(Some(run.state.execution().clone()));
            }
        }
        Ok(self.executions.get_execution(&execution_id).await?)
    }

    /// Executions, newest first.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.executions.list_executions(workflow_id, limit).await?)
    }

    pub async fn get_workflow_metrics(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowMetrics, EngineError> {
        let history = self
            .executions
            .list_executions(Some(workflow_id), METRICS_HISTORY_LIMIT)
            .await?;
        Ok(metrics::workflow_metrics(workflow_id, &history))
    }

    pub async fn get_system_metrics(&self) -> Result<SystemMetrics, EngineError> {
        let definitions = self.definitions.load().await?;
        let history = self
            .executions
            .list_executions(None, METRICS_HISTORY_LIMIT)
            .await?;
        let queues = match self.queue.get_system_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "queue stats unavailable for metrics");
                None
            }
        };
        Ok(metrics::system_metrics(&definitions, &history, queues.as_ref()))
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    pub fn on_workflow_start<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowExecution) + Send + Sync + 'static,
    {
        self.hooks.start.subscribe(callback)
    }

    pub fn on_workflow_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowExecution) + Send + Sync + 'static,
    {
        self.hooks.progress.subscribe(callback)
    }

    pub fn on_workflow_complete<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowExecution) + Send + Sync + 'static,
    {
        self.hooks.complete.subscribe(callback)
    }

    pub fn on_workflow_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowExecution) + Send + Sync + 'static,
    {
        self.hooks.error.subscribe(callback)
    }

    /// Run hooks and broadcast, outside the state lock.
    fn publish(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            match &event {
                WorkflowEvent::ExecutionStarted { execution } => self.hooks.start.emit(execution),
                WorkflowEvent::ExecutionProgress { execution } => {
                    self.hooks.progress.emit(execution)
                }
                WorkflowEvent::ExecutionCompleted { execution } => {
                    self.hooks.complete.emit(execution)
                }
                WorkflowEvent::ExecutionFailed { execution } => self.hooks.error.emit(execution),
                _ => {}
            }
            self.events.publish(event);
        }
    }
}

/// Build the job for one step of a run.
fn step_job(run: &Run, step: &StepDefinition) -> Result<JobData, String> {
    let execution = run.state.execution();
    let payload = StepJobPayload {
        execution_id: execution.execution_id,
        workflow_id: execution.workflow_id.clone(),
        step_id: step.id.clone(),
        step_type: step.step_type,
        config: step.config.clone(),
        input: execution.input.clone(),
        dependencies: run.state.dependency_outputs(step),
    };
    let payload = serde_json::to_value(&payload).map_err(|e| format!("invalid step payload: {e}"))?;

    let mut job = JobData::new(step.step_type.as_str(), payload)
        .with_retry(
            step.retry_policy
                .clone()
                .unwrap_or_else(|| run.defaults.retry.clone()),
        )
        .with_priority(step.priority.or(run.defaults.priority).unwrap_or_default());
    if let Some(timeout_ms) = step.timeout_ms.or(run.defaults.timeout_ms) {
        job = job.with_timeout_ms(timeout_ms);
    }
    Ok(job)
}

impl<D, X, S> WorkflowLauncher for WorkflowEngine<D, X, S>
where
    D: DefinitionRepository + 'static,
    X: ExecutionRepository + 'static,
    S: JobStore + 'static,
{
    fn launch<'a>(
        &'a self,
        workflow_id: &'a str,
        input: Value,
        source: TriggerSource,
    ) -> BoxFuture<'a, Result<Uuid, LaunchError>> {
        Box::pin(async move {
            self.launch_execution(workflow_id, input, source, None, None, None)
                .await
                .map_err(|e| match e {
                    EngineError::WorkflowNotFound(id) => LaunchError::WorkflowNotFound(id),
                    EngineError::WorkflowDisabled(id) => LaunchError::WorkflowDisabled(id),
                    other => LaunchError::Failed(other.to_string()),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use stepwise_types::execution::StepStatus;
    use stepwise_types::job::JobState;
    use stepwise_types::workflow::{FailureMode, TriggerConfig};

    use crate::processor::{ProcessorError, ProcessorFn, ProcessorRegistration, ProcessorRegistry};
    use crate::queue::JobContext;
    use crate::repository::memory::{
        MemoryDefinitionRepository, MemoryExecutionRepository, MemoryJobStore,
    };
    use crate::workflow::dag::test_support::step;

    type Engine =
        WorkflowEngine<MemoryDefinitionRepository, MemoryExecutionRepository, MemoryJobStore>;

    #[derive(Clone, Copy)]
    enum Plan {
        Succeed(u64),
        Fail,
        FailOnce,
    }

    struct Harness {
        engine: Arc<Engine>,
        executions: Arc<MemoryExecutionRepository>,
        plans: Arc<StdMutex<HashMap<String, Plan>>>,
        calls: Arc<StdMutex<Vec<String>>>,
    }

    impl Harness {
        fn plan(&self, step_id: &str, plan: Plan) {
            self.plans.lock().unwrap().insert(step_id.to_string(), plan);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn wait_terminal(&self, execution_id: Uuid) -> WorkflowExecution {
            for _ in 0..300 {
                let execution = self.engine.get_execution(execution_id).await.unwrap().unwrap();
                if execution.status.is_terminal() {
                    return execution;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("execution {execution_id} never finished");
        }
    }

    fn workflow(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: format!("Workflow {id}"),
            description: None,
            steps,
            triggers: vec![TriggerConfig::Manual {}],
            schedule: None,
            enabled: true,
            on_step_failure: FailureMode::Halt,
            created_at: None,
            updated_at: None,
            metadata: Default::default(),
        }
    }

    fn fan_out() -> WorkflowDefinition {
        workflow("fan", vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])])
    }

    fn scripted_processor(
        plans: Arc<StdMutex<HashMap<String, Plan>>>,
        calls: Arc<StdMutex<Vec<String>>>,
    ) -> ProcessorFn {
        Arc::new(
            move |job: JobData, _ctx: JobContext| -> BoxFuture<'static, Result<Value, ProcessorError>> {
                let plans = Arc::clone(&plans);
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    let step: StepJobPayload = serde_json::from_value(job.payload)
                        .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))?;
                    calls.lock().unwrap().push(step.step_id.clone());
                    let plan = {
                        let mut plans = plans.lock().unwrap();
                        match plans.get(&step.step_id).copied() {
                            Some(Plan::FailOnce) => {
                                plans.insert(step.step_id.clone(), Plan::Succeed(0));
                                Plan::Fail
                            }
                            Some(plan) => plan,
                            None => Plan::Succeed(0),
                        }
                    };
                    match plan {
                        Plan::Fail => Err(ProcessorError::Rejected(format!(
                            "{} refused",
                            step.step_id
                        ))),
                        Plan::Succeed(delay_ms) => {
                            if delay_ms > 0 {
                                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            }
                            Ok(json!({ "step": step.step_id, "deps": step.dependencies.len() }))
                        }
                        Plan::FailOnce => unreachable!(),
                    }
                })
            },
        )
    }

    async fn harness_with(
        definitions: Vec<WorkflowDefinition>,
        executions: Arc<MemoryExecutionRepository>,
    ) -> Harness {
        let config = EngineConfig {
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let queue = Arc::new(QueueManager::new(Arc::new(MemoryJobStore::new()), &config));
        let engine = WorkflowEngine::new(
            MemoryDefinitionRepository::new(),
            Arc::clone(&executions),
            Arc::clone(&queue),
            config,
        );
        for def in definitions {
            engine.create_workflow(def).await.unwrap();
        }

        let plans = Arc::new(StdMutex::new(HashMap::new()));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = ProcessorRegistry::new();
        registry.register_processor(ProcessorRegistration {
            name: "notification".to_string(),
            queue_name: QueueName::Notifications,
            concurrency: None,
            processor: scripted_processor(Arc::clone(&plans), Arc::clone(&calls)),
        });
        queue.start(Arc::new(registry)).await.unwrap();
        engine.start().await.unwrap();

        Harness {
            engine,
            executions,
            plans,
            calls,
        }
    }

    async fn harness(definitions: Vec<WorkflowDefinition>) -> Harness {
        harness_with(definitions, Arc::new(MemoryExecutionRepository::new())).await
    }

    // -----------------------------------------------------------------------
    // Sequencing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_dependants_wait_for_root_step() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::Succeed(60));

        let id = h.engine.execute_workflow_async("fan", json!({"doc": 1})).await.unwrap();
        let early = h.engine.get_execution(id).await.unwrap().unwrap();
        assert_eq!(early.steps["a"].status, StepStatus::Queued);
        assert_eq!(early.steps["b"].status, StepStatus::Pending);
        assert_eq!(early.steps["c"].status, StepStatus::Pending);

        let done = h.wait_terminal(id).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.steps["b"].output.as_ref().unwrap()["deps"], 1);

        let calls = h.calls();
        assert_eq!(calls[0], "a");
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_execute_workflow_returns_result() {
        let h = harness(vec![fan_out()]).await;
        let result = h
            .engine
            .execute_workflow("fan", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.results.len(), 3);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_further_enqueues() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::Succeed(80));

        let id = h.engine.execute_workflow_async("fan", json!({})).await.unwrap();
        assert!(h.engine.cancel_workflow(id).await.unwrap());
        assert!(!h.engine.cancel_workflow(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let execution = h.engine.get_execution(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.steps["b"].status, StepStatus::Skipped);
        assert_eq!(h.calls(), vec!["a"]);

        let stats = h.engine.queue().get_queue_stats(QueueName::Notifications).await.unwrap();
        assert_eq!(stats.completed + stats.waiting + stats.active, 1);
    }

    #[tokio::test]
    async fn test_step_failure_halts_execution() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::Fail);

        let result = h
            .engine
            .execute_workflow("fan", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(
            result.error.as_deref(),
            Some("step 'a' failed: rejected: a refused")
        );

        let execution = h.engine.get_execution(result.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.steps["b"].status, StepStatus::Skipped);
        assert_eq!(execution.steps["c"].status, StepStatus::Skipped);
        assert_eq!(h.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_continue_mode_finishes_independent_branch() {
        let mut def = workflow("cont", vec![step("a", &[]), step("b", &["a"]), step("d", &[])]);
        def.on_step_failure = FailureMode::Continue;
        let h = harness(vec![def]).await;
        h.plan("a", Plan::Fail);
        h.plan("d", Plan::Succeed(40));

        let result = h
            .engine
            .execute_workflow("cont", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.results.contains_key("d"));

        let execution = h.engine.get_execution(result.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.steps["b"].status, StepStatus::Skipped);
        assert_eq!(execution.steps["d"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_holds_ready_steps_until_resume() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::Succeed(50));

        let id = h.engine.execute_workflow_async("fan", json!({})).await.unwrap();
        assert!(h.engine.pause_workflow(id).await.unwrap());
        assert!(!h.engine.pause_workflow(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let paused = h.engine.get_execution(id).await.unwrap().unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.steps["a"].status, StepStatus::Completed);
        assert_eq!(paused.steps["b"].status, StepStatus::Pending);
        assert_eq!(h.calls(), vec!["a"]);

        assert!(h.engine.resume_workflow(id).await.unwrap());
        let done = h.wait_terminal(id).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_sync_timeout_cancels_execution() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::Succeed(500));

        let err = h
            .engine
            .execute_workflow(
                "fan",
                json!({}),
                ExecuteOptions {
                    timeout: Some(Duration::from_millis(50)),
                    priority: None,
                },
            )
            .await
            .unwrap_err();
        let EngineError::ExecutionTimeout(id) = err else {
            panic!("expected timeout, got {err}");
        };
        let execution = h.engine.get_execution(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_workflow_creates_new_execution() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::FailOnce);

        let failed = h
            .engine
            .execute_workflow("fan", json!({"run": 1}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);

        let retried = h.engine.retry_workflow(failed.execution_id).await.unwrap().unwrap();
        assert_ne!(retried, failed.execution_id);
        let done = h.wait_terminal(retried).await;
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.retry_of, Some(failed.execution_id));
        assert_eq!(done.trigger, TriggerSource::Retry);
        assert_eq!(done.input, json!({"run": 1}));

        // Only failed executions can be retried.
        assert!(h.engine.retry_workflow(retried).await.unwrap().is_none());
        let original = h.engine.get_execution(failed.execution_id).await.unwrap().unwrap();
        assert_eq!(original.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_execution_controls_report_not_found() {
        let h = harness(vec![]).await;
        let unknown = Uuid::now_v7();
        assert!(!h.engine.pause_workflow(unknown).await.unwrap());
        assert!(!h.engine.resume_workflow(unknown).await.unwrap());
        assert!(!h.engine.cancel_workflow(unknown).await.unwrap());
        assert!(h.engine.retry_workflow(unknown).await.unwrap().is_none());
        assert!(h.engine.get_execution(unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_workflows_rejected() {
        let mut disabled = workflow("off", vec![step("a", &[])]);
        disabled.enabled = false;
        let h = harness(vec![disabled]).await;

        assert!(matches!(
            h.engine.execute_workflow_async("missing", json!({})).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            h.engine.execute_workflow_async("off", json!({})).await,
            Err(EngineError::WorkflowDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_stored_definition_is_not_run() {
        let h = harness(vec![]).await;
        // Written straight to the store, as a hand edit of the file would be.
        h.engine
            .definitions()
            .save(vec![workflow("empty", vec![])])
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            h.engine
                .execute_workflow("empty", json!({}), ExecuteOptions::default()),
        )
        .await
        .expect("execute_workflow hung");
        let Err(EngineError::Validation(report)) = outcome else {
            panic!("empty workflow was launched");
        };
        assert!(report.errors.iter().any(|e| e.contains("at least one step")));
        assert!(h.engine.list_executions(None, 10).await.unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_definition_management() {
        let h = harness(vec![]).await;
        let mut changes = h.engine.definition_events().subscribe();

        let created = h.engine.create_workflow(fan_out()).await.unwrap();
        let created_at = created.created_at.unwrap();
        assert!(matches!(
            h.engine.create_workflow(fan_out()).await,
            Err(EngineError::AlreadyExists(_))
        ));

        let cyclic = workflow("loop", vec![step("a", &["b"]), step("b", &["a"])]);
        let Err(EngineError::Validation(report)) = h.engine.create_workflow(cyclic).await else {
            panic!("cycle accepted");
        };
        assert!(report.errors.iter().any(|e| e.contains("a -> b -> a")));

        let mut renamed = fan_out();
        renamed.name = "Renamed".to_string();
        let updated = h.engine.update_workflow(renamed).await.unwrap();
        assert_eq!(updated.created_at, Some(created_at));
        assert_eq!(
            h.engine.get_workflow("fan").await.unwrap().unwrap().name,
            "Renamed"
        );
        assert!(matches!(
            h.engine.update_workflow(workflow("ghost", vec![step("a", &[])])).await,
            Err(EngineError::WorkflowNotFound(_))
        ));

        assert!(h.engine.delete_workflow("fan").await.unwrap());
        assert!(!h.engine.delete_workflow("fan").await.unwrap());
        assert!(h.engine.list_workflows().await.unwrap().is_empty());

        assert!(matches!(changes.try_recv().unwrap(), DefinitionChange::Created { .. }));
        assert!(matches!(changes.try_recv().unwrap(), DefinitionChange::Updated { .. }));
        assert!(matches!(changes.try_recv().unwrap(), DefinitionChange::Deleted { .. }));
    }

    #[tokio::test]
    async fn test_validate_workflow_warns_about_isolated_steps() {
        let h = harness(vec![]).await;
        let report = h
            .engine
            .validate_workflow(&workflow("iso", vec![step("a", &[]), step("b", &[])]));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Durability, hooks, metrics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_fails_interrupted_executions() {
        let executions = Arc::new(MemoryExecutionRepository::new());
        let mut orphan = ExecutionState::new(
            &fan_out(),
            json!({}),
            TriggerSource::Manual,
            None,
        );
        orphan.start();
        let orphan_id = orphan.execution_id();
        executions.save_execution(orphan.execution()).await.unwrap();

        let h = harness_with(vec![fan_out()], executions).await;
        let recovered = h.engine.get_execution(orphan_id).await.unwrap().unwrap();
        assert_eq!(recovered.status, ExecutionStatus::Failed);
        assert_eq!(recovered.error.as_deref(), Some(INTERRUPTED_REASON));
        assert!(h.engine.retry_workflow(orphan_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_hooks_fire_and_panics_are_isolated() {
        let h = harness(vec![fan_out()]).await;
        let started = Arc::new(AtomicUsize::new(0));
        let progressed = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&started);
        let _start = h.engine.on_workflow_start(move |e| {
            assert_eq!(e.status, ExecutionStatus::Running);
            s.fetch_add(1, Ordering::SeqCst);
        });
        let p = Arc::clone(&progressed);
        let _progress = h.engine.on_workflow_progress(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let _boom = h.engine.on_workflow_complete(|_| panic!("listener bug"));
        let c = Arc::clone(&completed);
        let _complete = h.engine.on_workflow_complete(move |e| {
            assert_eq!(e.progress, 100);
            c.fetch_add(1, Ordering::SeqCst);
        });

        let result = h
            .engine
            .execute_workflow("fan", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(progressed.load(Ordering::SeqCst), 2);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_executions_are_persisted_and_measured() {
        let h = harness(vec![fan_out()]).await;
        h.plan("a", Plan::FailOnce);

        let first = h
            .engine
            .execute_workflow("fan", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        let second = h
            .engine
            .execute_workflow("fan", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::Failed);
        assert_eq!(second.status, ExecutionStatus::Completed);

        let stored = h.executions.get_execution(&second.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);

        let listed = h.engine.list_executions(Some("fan"), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, second.execution_id);

        let metrics = h.engine.get_workflow_metrics("fan").await.unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.success_rate, 0.5);

        let system = h.engine.get_system_metrics().await.unwrap();
        assert_eq!(system.workflows, 1);
        assert_eq!(system.executions, 2);
    }

    #[tokio::test]
    async fn test_launcher_seam_records_trigger_source() {
        let h = harness(vec![fan_out()]).await;
        let launcher: Arc<dyn WorkflowLauncher> = h.engine.clone();

        let id = launcher
            .launch("fan", json!({"files": ["/tmp/a.pdf"]}), TriggerSource::FileWatch)
            .await
            .unwrap();
        let done = h.wait_terminal(id).await;
        assert_eq!(done.trigger, TriggerSource::FileWatch);

        let err = launcher
            .launch("missing", json!({}), TriggerSource::Schedule)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_step_priority_and_defaults_reach_jobs() {
        let mut def = workflow("prio", vec![step("a", &[])]);
        def.steps[0].timeout_ms = Some(5_000);
        let h = harness(vec![def]).await;
        let mut queue_events = h.engine.queue().events().subscribe();

        h.engine
            .execute_workflow(
                "prio",
                json!({}),
                ExecuteOptions {
                    timeout: None,
                    priority: Some(JobPriority::High),
                },
            )
            .await
            .unwrap();

        let job_id = loop {
            if let stepwise_types::event::QueueEvent::JobAdded { job_id, .. } =
                queue_events.recv().await.unwrap()
            {
                break job_id;
            }
        };
        let job = h.engine.queue().get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.max_attempts, RetryPolicy::default().max_retries + 1);
    }
}
