//! Trigger plumbing shared by the cron scheduler and the file watcher.
//!
//! Both trigger sources start executions through the [`WorkflowLauncher`]
//! seam, which the workflow engine implements.

pub mod launcher;
pub mod scheduler;

pub use launcher::{LaunchError, WorkflowLauncher};
pub use scheduler::{CronScheduler, ScheduledWorkflowInfo, SchedulerError};
