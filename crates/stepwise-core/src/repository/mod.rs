//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; [`memory`] provides in-process
//! implementations for tests and ephemeral runs.

pub mod definition;
pub mod execution;
pub mod job;
pub mod memory;

pub use definition::DefinitionRepository;
pub use execution::ExecutionRepository;
pub use job::JobStore;
