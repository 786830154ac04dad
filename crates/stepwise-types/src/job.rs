//! Job and queue domain types.
//!
//! A job is the unit of work handed to a named queue. The queue manager owns
//! a job from the moment it is enqueued and is the only writer of its state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Queue names
// ---------------------------------------------------------------------------

/// The closed set of named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    DocumentProcessing,
    AiAnalysis,
    WorkflowExecution,
    FileOperations,
    Notifications,
}

impl QueueName {
    /// Every queue, in a stable order.
    pub const ALL: [QueueName; 5] = [
        QueueName::DocumentProcessing,
        QueueName::AiAnalysis,
        QueueName::WorkflowExecution,
        QueueName::FileOperations,
        QueueName::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::DocumentProcessing => "document-processing",
            QueueName::AiAnalysis => "ai-analysis",
            QueueName::WorkflowExecution => "workflow-execution",
            QueueName::FileOperations => "file-operations",
            QueueName::Notifications => "notifications",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Job priority tier. Higher tiers are always claimed before lower ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl JobPriority {
    /// Sort rank used by job stores: lower rank is claimed first.
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::High => 1,
            JobPriority::Medium => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(JobPriority::High),
            2 => Some(JobPriority::Medium),
            3 => Some(JobPriority::Low),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Retry policy applied when a job's handler fails.
///
/// `max_retries` counts retries, not attempts: a policy with `max_retries = 2`
/// allows three attempts in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries", alias = "max_retries")]
    pub max_retries: u32,
    #[serde(default, alias = "backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay", alias = "initial_delay")]
    pub initial_delay: u64,
    /// Upper bound for any retry delay, in milliseconds.
    #[serde(default = "default_max_delay", alias = "max_delay")]
    pub max_delay: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_strategy: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Job data
// ---------------------------------------------------------------------------

/// Per-job options chosen at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt handler timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A unit of work handed to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub id: String,
    /// Processor key; the registry dispatches on this.
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
}

impl JobData {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            payload,
            options: JobOptions::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// A job as held by a job store, including its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredJob {
    pub data: JobData,
    pub queue: QueueName,
    pub state: JobState,
    /// Number of times a worker has claimed this job.
    pub attempts_made: u32,
    /// Earliest instant the job may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    /// Wrap freshly enqueued job data as a waiting job.
    pub fn waiting(queue: QueueName, data: JobData) -> Self {
        let available_at = data.created_at;
        Self {
            data,
            queue,
            state: JobState::Waiting,
            attempts_made: 0,
            available_at,
            progress: 0,
            failed_reason: None,
            result: None,
            processed_at: None,
            finished_at: None,
        }
    }
}

/// Read-only view of a job returned by `get_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub queue: QueueName,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    pub priority: JobPriority,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<StoredJob> for JobStatus {
    fn from(job: StoredJob) -> Self {
        Self {
            max_attempts: job.data.options.retry.max_retries.saturating_add(1),
            priority: job.data.options.priority,
            id: job.data.id,
            queue: job.queue,
            job_type: job.data.job_type,
            state: job.state,
            attempts_made: job.attempts_made,
            progress: job.progress,
            failed_reason: job.failed_reason,
            result: job.result,
            created_at: job.data.created_at,
            available_at: job.available_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Raw per-state counts reported by a job store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    /// Waiting jobs whose `available_at` lies in the future.
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Statistics for a single queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: QueueName,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
    pub concurrency: usize,
}

/// Statistics across every queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub queues: Vec<QueueStats>,
    pub total_waiting: u64,
    pub total_active: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub healthy: bool,
}
