//! Workflow definitions, DAG planning, and the execution engine.

pub mod dag;
pub mod definition;
pub mod engine;
pub mod metrics;
pub mod retry;
pub mod state;

pub use definition::{DefinitionError, DefinitionStore, validate_definition};
pub use engine::{EngineError, ExecuteOptions, WorkflowEngine};
pub use retry::RetryHandler;
pub use state::{ExecutionState, Transition};
