//! Workflow engine, queue manager, and repository trait definitions for Stepwise.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus in-memory implementations used by tests and
//! ephemeral runs. It depends only on `stepwise-types` -- never on
//! `stepwise-infra` or any database crate.

pub mod event;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod trigger;
pub mod workflow;
