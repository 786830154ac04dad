//! Job processors: the registry that maps job types to handlers, the
//! collaborator seams for document and AI work, and the built-in handlers for
//! the well-known queues.

pub mod builtin;
pub mod collaborator;
pub mod registry;

pub use builtin::{Collaborators, register_built_in_processors};
pub use registry::{ProcessorFn, ProcessorRegistration, ProcessorRegistry};

/// Errors raised by job handlers.
///
/// Only [`is_retryable`](Self::is_retryable) errors go through the job's
/// retry policy; everything else fails the job on the spot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Failed(String),

    #[error("job timed out after {0}ms")]
    Timeout(u64),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no processor registered for job type '{0}'")]
    NoProcessor(String),

    #[error("job type '{job_type}' belongs to queue '{expected}', not '{actual}'")]
    WrongQueue {
        job_type: String,
        expected: String,
        actual: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl ProcessorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessorError::Failed(_) | ProcessorError::Timeout(_) | ProcessorError::Panicked(_)
        )
    }
}
