//! Engine configuration types.
//!
//! `EngineConfig` represents `stepwise.toml`. Every field has a default so a
//! missing or partial file still yields a runnable configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::{QueueName, RetryPolicy};

/// Concurrency used for queues with no explicit setting.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 5;

/// Top-level configuration, loaded from `stepwise.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the JSON definition file (default `<data_dir>/workflows.json`).
    #[serde(default)]
    pub definitions_file: Option<PathBuf>,

    /// SQLite URL (default `sqlite://<data_dir>/stepwise.db?mode=rwc`).
    #[serde(default)]
    pub database_url: Option<String>,

    /// How long an idle queue dispatcher sleeps before polling for delayed jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_file_watch_debounce_ms")]
    pub file_watch_debounce_ms: u64,

    /// How long a launched file stays suppressed after its last event.
    #[serde(default = "default_file_watch_dedup_ms")]
    pub file_watch_dedup_ms: u64,

    /// Interval of the file watcher root-path health check.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Job timeout applied when neither the step nor the definition file sets one.
    #[serde(default)]
    pub default_job_timeout_ms: Option<u64>,

    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Per-queue settings keyed by queue name (e.g. `[queues.ai-analysis]`).
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSettings>,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_file_watch_debounce_ms() -> u64 {
    500
}

fn default_file_watch_dedup_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            definitions_file: None,
            database_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            file_watch_debounce_ms: default_file_watch_debounce_ms(),
            file_watch_dedup_ms: default_file_watch_dedup_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            default_job_timeout_ms: None,
            default_retry: RetryPolicy::default(),
            queues: BTreeMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configured concurrency for a queue, if any.
    pub fn queue_concurrency(&self, queue: QueueName) -> Option<usize> {
        self.queues
            .get(queue.as_str())
            .and_then(|settings| settings.concurrency)
            .filter(|c| *c > 0)
    }
}

/// Settings for a single named queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
