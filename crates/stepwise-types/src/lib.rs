//! Shared domain types for Stepwise.
//!
//! This crate contains the data model shared across the Stepwise workspace:
//! workflow definitions, executions, jobs and queues, lifecycle events,
//! engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod job;
pub mod workflow;
