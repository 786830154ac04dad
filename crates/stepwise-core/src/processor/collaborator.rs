//! Collaborator seams for the built-in step processors.
//!
//! Document parsing, estimation, text generation, and message delivery live
//! outside this crate. Each is an object-safe trait with boxed futures so the
//! binary can plug in whatever implementation it has (or none).

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::ProcessorError;
use super::builtin::StepJobPayload;

/// Document parsing and requirement extraction.
pub trait DocumentService: Send + Sync {
    fn analyze<'a>(
        &'a self,
        source: &'a str,
        extract_tables: bool,
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>>;

    fn extract_requirements<'a>(
        &'a self,
        source: &'a str,
        categories: &'a [String],
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>>;
}

/// Parameters of an `estimation` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationRequest {
    pub methodology: Option<String>,
    pub hourly_rate: Option<f64>,
    pub contingency_percent: Option<f64>,
}

/// Effort and cost estimation.
pub trait EstimationService: Send + Sync {
    fn estimate<'a>(
        &'a self,
        request: &'a EstimationRequest,
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>>;
}

/// Parameters of a `communication-generation` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub template: String,
    pub audience: Option<String>,
    pub tone: Option<String>,
}

/// Text generation for client communications.
pub trait TextGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>>;
}

/// A message to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub recipients: Vec<String>,
    pub message: String,
}

/// Message delivery (email, chat, ...).
pub trait Notifier: Send + Sync {
    fn send<'a>(
        &'a self,
        notification: &'a Notification,
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>>;
}

/// Notifier that writes each notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send<'a>(
        &'a self,
        notification: &'a Notification,
        step: &'a StepJobPayload,
    ) -> BoxFuture<'a, Result<Value, ProcessorError>> {
        Box::pin(async move {
            tracing::info!(
                workflow_id = %step.workflow_id,
                execution_id = %step.execution_id,
                channel = %notification.channel,
                recipients = notification.recipients.len(),
                message = %notification.message,
                "notification"
            );
            Ok(json!({
                "channel": notification.channel,
                "delivered": notification.recipients.len(),
            }))
        })
    }
}
