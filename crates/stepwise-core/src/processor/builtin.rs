//! Built-in processors for the well-known job types.
//!
//! Step jobs carry a [`StepJobPayload`]; each handler pulls its typed config
//! out of it and delegates to a collaborator. File operations run locally and
//! are idempotent, so a redelivered job converges on the same filesystem state.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stepwise_types::execution::TriggerSource;
use stepwise_types::job::{JobData, QueueName};
use stepwise_types::workflow::{FileOperationKind, StepConfig, StepType};
use uuid::Uuid;

use super::collaborator::{
    DocumentService, EstimationRequest, EstimationService, GenerationRequest, Notification,
    Notifier, TextGenerator,
};
use super::registry::{ProcessorFn, ProcessorRegistration, ProcessorRegistry};
use super::ProcessorError;
use crate::queue::JobContext;
use crate::trigger::{LaunchError, WorkflowLauncher};

/// Job type of queued workflow starts.
pub const EXECUTE_WORKFLOW_JOB: &str = "execute-workflow";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of a job enqueued for a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepJobPayload {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    pub step_type: StepType,
    pub config: StepConfig,
    /// The execution's input.
    #[serde(default)]
    pub input: Value,
    /// Outputs of the step's completed dependencies, keyed by step id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Value>,
}

/// Payload of an `execute-workflow` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowPayload {
    pub workflow_id: String,
    #[serde(default)]
    pub input: Value,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Implementations handed to the built-in processors. `None` means "not
/// available here": jobs needing it fail without retry.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub documents: Option<Arc<dyn DocumentService>>,
    pub estimator: Option<Arc<dyn EstimationService>>,
    pub text: Option<Arc<dyn TextGenerator>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub launcher: Option<Arc<dyn WorkflowLauncher>>,
}

/// Register a processor for every step type on its default queue, plus the
/// `execute-workflow` processor on `workflow-execution`.
pub fn register_built_in_processors(registry: &mut ProcessorRegistry, collaborators: Collaborators) {
    let Collaborators {
        documents,
        estimator,
        text,
        notifier,
        launcher,
    } = collaborators;

    for step_type in StepType::ALL {
        let processor = match step_type {
            StepType::DocumentAnalysis | StepType::RequirementExtraction => {
                document_processor(documents.clone())
            }
            StepType::Estimation => estimation_processor(estimator.clone()),
            StepType::CommunicationGeneration => generation_processor(text.clone()),
            StepType::FileOperation => file_operation_processor(),
            StepType::Notification => notification_processor(notifier.clone()),
        };
        registry.register_processor(ProcessorRegistration {
            name: step_type.as_str().to_string(),
            queue_name: step_type.default_queue(),
            concurrency: None,
            processor,
        });
    }

    registry.register_processor(ProcessorRegistration {
        name: EXECUTE_WORKFLOW_JOB.to_string(),
        queue_name: QueueName::WorkflowExecution,
        concurrency: None,
        processor: execute_workflow_processor(launcher),
    });
}

type HandlerFuture = BoxFuture<'static, Result<Value, ProcessorError>>;

/// Wrap a handler that takes a decoded [`StepJobPayload`].
fn step_processor<F>(handler: F) -> ProcessorFn
where
    F: Fn(StepJobPayload, JobContext) -> HandlerFuture + Send + Sync + 'static,
{
    Arc::new(move |job: JobData, ctx: JobContext| -> HandlerFuture {
        match serde_json::from_value::<StepJobPayload>(job.payload) {
            Ok(step) => handler(step, ctx),
            Err(e) => Box::pin(async move { Err(ProcessorError::InvalidPayload(e.to_string())) }),
        }
    })
}

fn not_configured(what: &str) -> ProcessorError {
    ProcessorError::Rejected(format!("no {what} configured"))
}

fn config_mismatch(step: &StepJobPayload) -> ProcessorError {
    ProcessorError::InvalidPayload(format!(
        "step '{}' of type '{}' carries '{}' config",
        step.step_id,
        step.step_type,
        step.config.step_type()
    ))
}

// ---------------------------------------------------------------------------
// Delegating processors
// ---------------------------------------------------------------------------

fn document_processor(documents: Option<Arc<dyn DocumentService>>) -> ProcessorFn {
    step_processor(move |step, _ctx| {
        let documents = documents.clone();
        Box::pin(async move {
            let documents = documents.ok_or_else(|| not_configured("document service"))?;
            match &step.config {
                StepConfig::DocumentAnalysis {
                    source,
                    extract_tables,
                } => documents.analyze(source, *extract_tables, &step).await,
                StepConfig::RequirementExtraction { source, categories } => {
                    documents.extract_requirements(source, categories, &step).await
                }
                _ => Err(config_mismatch(&step)),
            }
        })
    })
}

fn estimation_processor(estimator: Option<Arc<dyn EstimationService>>) -> ProcessorFn {
    step_processor(move |step, _ctx| {
        let estimator = estimator.clone();
        Box::pin(async move {
            let estimator = estimator.ok_or_else(|| not_configured("estimation service"))?;
            let StepConfig::Estimation {
                methodology,
                hourly_rate,
                contingency_percent,
            } = &step.config
            else {
                return Err(config_mismatch(&step));
            };
            let request = EstimationRequest {
                methodology: methodology.clone(),
                hourly_rate: *hourly_rate,
                contingency_percent: *contingency_percent,
            };
            estimator.estimate(&request, &step).await
        })
    })
}

fn generation_processor(text: Option<Arc<dyn TextGenerator>>) -> ProcessorFn {
    step_processor(move |step, _ctx| {
        let text = text.clone();
        Box::pin(async move {
            let text = text.ok_or_else(|| not_configured("text generator"))?;
            let StepConfig::CommunicationGeneration {
                template,
                audience,
                tone,
            } = &step.config
            else {
                return Err(config_mismatch(&step));
            };
            let request = GenerationRequest {
                template: template.clone(),
                audience: audience.clone(),
                tone: tone.clone(),
            };
            text.generate(&request, &step).await
        })
    })
}

fn notification_processor(notifier: Option<Arc<dyn Notifier>>) -> ProcessorFn {
    step_processor(move |step, _ctx| {
        let notifier = notifier.clone();
        Box::pin(async move {
            let notifier = notifier.ok_or_else(|| not_configured("notifier"))?;
            let StepConfig::Notification {
                channel,
                recipients,
                message,
            } = &step.config
            else {
                return Err(config_mismatch(&step));
            };
            let notification = Notification {
                channel: channel.clone(),
                recipients: recipients.clone(),
                message: message.clone(),
            };
            notifier.send(&notification, &step).await
        })
    })
}

fn execute_workflow_processor(launcher: Option<Arc<dyn WorkflowLauncher>>) -> ProcessorFn {
    Arc::new(move |job: JobData, _ctx: JobContext| -> HandlerFuture {
        Box::pin(execute_workflow(launcher.clone(), job))
    })
}

async fn execute_workflow(
    launcher: Option<Arc<dyn WorkflowLauncher>>,
    job: JobData,
) -> Result<Value, ProcessorError> {
    let launcher = launcher.ok_or_else(|| not_configured("workflow launcher"))?;
    let payload: ExecuteWorkflowPayload = serde_json::from_value(job.payload)
        .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))?;
    let execution_id = launcher
        .launch(&payload.workflow_id, payload.input, TriggerSource::Queue)
        .await
        .map_err(|e| match e {
            LaunchError::WorkflowNotFound(_) | LaunchError::WorkflowDisabled(_) => {
                ProcessorError::Rejected(e.to_string())
            }
            LaunchError::Failed(reason) => ProcessorError::Failed(reason),
        })?;
    Ok(json!({ "executionId": execution_id }))
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

fn file_operation_processor() -> ProcessorFn {
    step_processor(|step, ctx| Box::pin(file_operation(step, ctx)))
}

async fn file_operation(step: StepJobPayload, ctx: JobContext) -> Result<Value, ProcessorError> {
    let StepConfig::FileOperation {
        operation,
        source,
        destination,
    } = &step.config
    else {
        return Err(config_mismatch(&step));
    };
    let outcome = run_file_operation(*operation, source, destination.as_deref()).await?;
    ctx.report_progress(100);
    Ok(outcome)
}

fn io_failure(action: &str, path: &str, e: std::io::Error) -> ProcessorError {
    ProcessorError::Failed(format!("{action} '{path}': {e}"))
}

async fn run_file_operation(
    operation: FileOperationKind,
    source: &str,
    destination: Option<&str>,
) -> Result<Value, ProcessorError> {
    let require_destination = || {
        destination.ok_or_else(|| {
            ProcessorError::InvalidPayload(format!("{operation:?} requires a destination"))
        })
    };

    match operation {
        FileOperationKind::Copy => {
            let dest = require_destination()?;
            ensure_parent(dest).await?;
            let bytes = tokio::fs::copy(source, dest)
                .await
                .map_err(|e| io_failure("copy", source, e))?;
            Ok(json!({ "operation": "copy", "source": source, "destination": dest, "bytes": bytes }))
        }
        FileOperationKind::Move => {
            let dest = require_destination()?;
            let source_exists = path_exists(source).await;
            if !source_exists && path_exists(dest).await {
                // Already moved by an earlier delivery.
                return Ok(json!({ "operation": "move", "source": source, "destination": dest, "moved": false }));
            }
            ensure_parent(dest).await?;
            if tokio::fs::rename(source, dest).await.is_err() {
                // Cross-device rename: fall back to copy + remove.
                tokio::fs::copy(source, dest)
                    .await
                    .map_err(|e| io_failure("move", source, e))?;
                tokio::fs::remove_file(source)
                    .await
                    .map_err(|e| io_failure("remove", source, e))?;
            }
            Ok(json!({ "operation": "move", "source": source, "destination": dest, "moved": true }))
        }
        FileOperationKind::Delete => {
            let deleted = match tokio::fs::metadata(source).await {
                Ok(meta) if meta.is_dir() => {
                    tokio::fs::remove_dir_all(source)
                        .await
                        .map_err(|e| io_failure("delete", source, e))?;
                    true
                }
                Ok(_) => {
                    tokio::fs::remove_file(source)
                        .await
                        .map_err(|e| io_failure("delete", source, e))?;
                    true
                }
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(io_failure("delete", source, e)),
            };
            Ok(json!({ "operation": "delete", "source": source, "deleted": deleted }))
        }
        FileOperationKind::Mkdir => {
            tokio::fs::create_dir_all(source)
                .await
                .map_err(|e| io_failure("mkdir", source, e))?;
            Ok(json!({ "operation": "mkdir", "source": source }))
        }
    }
}

async fn path_exists(path: &str) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn ensure_parent(path: &str) -> Result<(), ProcessorError> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_failure("create directory for", path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::queue::JobDispatcher;
    use crate::trigger::launcher::test_support::RecordingLauncher;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl Notifier for RecordingNotifier {
        fn send<'a>(
            &'a self,
            notification: &'a Notification,
            _step: &'a StepJobPayload,
        ) -> BoxFuture<'a, Result<Value, ProcessorError>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(notification.clone());
                Ok(json!({"delivered": notification.recipients.len()}))
            })
        }
    }

    fn step_job(config: StepConfig) -> JobData {
        let payload = StepJobPayload {
            execution_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            step_id: "s1".to_string(),
            step_type: config.step_type(),
            config,
            input: json!({}),
            dependencies: BTreeMap::new(),
        };
        JobData::new(
            payload.step_type.as_str(),
            serde_json::to_value(&payload).unwrap(),
        )
    }

    async fn run(
        registry: &ProcessorRegistry,
        job: JobData,
        queue: QueueName,
    ) -> Result<Value, ProcessorError> {
        let ctx = JobContext::detached(&job, queue, 1);
        registry.dispatch(job, ctx).await
    }

    fn file_op(operation: FileOperationKind, source: &Path, destination: Option<&Path>) -> JobData {
        step_job(StepConfig::FileOperation {
            operation,
            source: source.to_string_lossy().to_string(),
            destination: destination.map(|d| d.to_string_lossy().to_string()),
        })
    }

    fn registry(collaborators: Collaborators) -> ProcessorRegistry {
        let mut registry = ProcessorRegistry::new();
        register_built_in_processors(&mut registry, collaborators);
        registry
    }

    #[test]
    fn test_registers_every_step_type_and_execute_workflow() {
        let registry = registry(Collaborators::default());
        for step_type in StepType::ALL {
            let registration = registry.get(step_type.as_str()).unwrap();
            assert_eq!(registration.queue_name, step_type.default_queue());
        }
        assert_eq!(
            registry.get(EXECUTE_WORKFLOW_JOB).unwrap().queue_name,
            QueueName::WorkflowExecution
        );
    }

    #[tokio::test]
    async fn test_missing_collaborator_rejects_without_retry() {
        let registry = registry(Collaborators::default());
        let job = step_job(StepConfig::Estimation {
            methodology: None,
            hourly_rate: Some(120.0),
            contingency_percent: None,
        });
        let err = run(&registry, job, QueueName::AiAnalysis).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid() {
        let registry = registry(Collaborators::default());
        let job = JobData::new("notification", json!({"nope": true}));
        let err = run(&registry, job, QueueName::Notifications).await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_notification_delegates_to_notifier() {
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = registry(Collaborators {
            notifier: Some(notifier.clone()),
            ..Collaborators::default()
        });
        let job = step_job(StepConfig::Notification {
            channel: "email".to_string(),
            recipients: vec!["pm@example.com".to_string(), "cto@example.com".to_string()],
            message: "Estimate ready".to_string(),
        });

        let result = run(&registry, job, QueueName::Notifications).await.unwrap();
        assert_eq!(result["delivered"], 2);
        assert_eq!(notifier.sent.lock().unwrap()[0].message, "Estimate ready");
    }

    #[tokio::test]
    async fn test_execute_workflow_launches_from_queue() {
        let launcher = Arc::new(RecordingLauncher::default());
        let registry = registry(Collaborators {
            launcher: Some(launcher.clone()),
            ..Collaborators::default()
        });
        let job = JobData::new(
            EXECUTE_WORKFLOW_JOB,
            json!({"workflowId": "nightly", "input": {"batch": 7}}),
        );

        let result = run(&registry, job, QueueName::WorkflowExecution).await.unwrap();
        assert!(result["executionId"].is_string());
        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches[0].0, "nightly");
        assert_eq!(launches[0].1, json!({"batch": 7}));
        assert_eq!(launches[0].2, TriggerSource::Queue);
    }

    #[tokio::test]
    async fn test_copy_creates_destination_parent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        let dest = dir.path().join("out/nested/copy.txt");
        std::fs::write(&source, "hello").unwrap();

        let registry = registry(Collaborators::default());
        let job = file_op(FileOperationKind::Copy, &source, Some(&dest));
        let result = run(&registry, job, QueueName::FileOperations).await.unwrap();

        assert_eq!(result["bytes"], 5);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_move_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        let dest = dir.path().join("archive/in.txt");
        std::fs::write(&source, "data").unwrap();

        let registry = registry(Collaborators::default());
        let first = run(&registry, file_op(FileOperationKind::Move, &source, Some(&dest)), QueueName::FileOperations)
            .await
            .unwrap();
        let second = run(&registry, file_op(FileOperationKind::Move, &source, Some(&dest)), QueueName::FileOperations)
            .await
            .unwrap();

        assert_eq!(first["moved"], true);
        assert_eq!(second["moved"], false);
        assert!(!source.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "data");
    }

    #[tokio::test]
    async fn test_delete_missing_path_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("f.txt"), "x").unwrap();

        let registry = registry(Collaborators::default());
        let first = run(&registry, file_op(FileOperationKind::Delete, &target, None), QueueName::FileOperations)
            .await
            .unwrap();
        let second = run(&registry, file_op(FileOperationKind::Delete, &target, None), QueueName::FileOperations)
            .await
            .unwrap();

        assert_eq!(first["deleted"], true);
        assert_eq!(second["deleted"], false);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_mkdir_and_copy_without_destination() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        let registry = registry(Collaborators::default());

        run(&registry, file_op(FileOperationKind::Mkdir, &target, None), QueueName::FileOperations)
            .await
            .unwrap();
        assert!(target.is_dir());

        let err = run(&registry, file_op(FileOperationKind::Copy, &target, None), QueueName::FileOperations)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidPayload(_)));
    }
}
