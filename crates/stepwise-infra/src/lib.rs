//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the repository traits defined in `stepwise-core`:
//! SQLite job and execution storage, the JSON definition file, configuration
//! loading, and the filesystem-driven triggers (file watcher plus the
//! supervisor that keeps triggers in step with stored definitions).

pub mod config;
pub mod definition;
pub mod sqlite;
pub mod trigger;
