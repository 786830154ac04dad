//! Cron scheduler for workflow triggers.
//!
//! Provides:
//! - Standard cron expression parsing (5-field normalized to 6-field)
//! - Human-readable schedule normalization ("every 5 minutes" -> cron)
//! - Timezone-aware next-run computation via `croner`
//! - One timer task per scheduled workflow, cancelled on unschedule
//!
//! Each fire calls [`WorkflowLauncher::launch`] with an empty input. Launch
//! failures are logged and the timer keeps running.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use croner::Cron;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stepwise_types::execution::TriggerSource;
use stepwise_types::workflow::ScheduleConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::launcher::WorkflowLauncher;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or schedule string.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Unknown IANA zone or malformed fixed offset.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

// ---------------------------------------------------------------------------
// Human-readable schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression.
///
/// Supported patterns (case-insensitive):
/// - 5-field cron            -> seconds field `0` prepended
/// - 6-field cron            -> unchanged
/// - "every N seconds"       -> "*/N * * * * *"
/// - "every N minutes"       -> "0 */N * * * *"
/// - "every N hours"         -> "0 0 */N * * *"
/// - "every minute"          -> "0 * * * * *"
/// - "every hour", "hourly"  -> "0 0 * * * *"
/// - "every day", "daily"    -> "0 0 0 * * *"
/// - "every day at HH:MM"    -> "0 MM HH * * *"
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.len() {
        5 => return Ok(format!("0 {}", parts.join(" "))),
        6 => return Ok(parts.join(" ")),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at) = rest.strip_prefix("day at ") {
            let (hour, minute) = at
                .split_once(':')
                .and_then(|(h, m)| Some((h.trim().parse::<u32>().ok()?, m.trim().parse::<u32>().ok()?)))
                .ok_or_else(|| SchedulerError::InvalidSchedule(input.to_string()))?;
            if hour < 24 && minute < 60 {
                return Ok(format!("0 {minute} {hour} * * *"));
            }
            return Err(SchedulerError::InvalidSchedule(input.to_string()));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if let [count, unit] = words.as_slice() {
            let n: u32 = count
                .parse()
                .map_err(|_| SchedulerError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be > 0".to_string(),
                ));
            }
            return match unit.trim_end_matches('s') {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(SchedulerError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(SchedulerError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

// ---------------------------------------------------------------------------
// Timezones and next-run computation
// ---------------------------------------------------------------------------

/// The zone a schedule's wall-clock fields are interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Utc,
    Named(Tz),
    Fixed(FixedOffset),
}

/// Parse an IANA zone name ("Europe/Berlin") or fixed offset ("+05:30").
/// `None`, empty, "UTC" and "Z" mean UTC.
pub fn parse_timezone(timezone: Option<&str>) -> Result<ScheduleZone, SchedulerError> {
    let Some(name) = timezone.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(ScheduleZone::Utc);
    };
    if name.eq_ignore_ascii_case("utc") || name == "Z" {
        return Ok(ScheduleZone::Utc);
    }
    if name.starts_with('+') || name.starts_with('-') {
        return parse_fixed_offset(name)
            .map(ScheduleZone::Fixed)
            .ok_or_else(|| SchedulerError::InvalidTimezone(name.to_string()));
    }
    name.parse::<Tz>()
        .map(ScheduleZone::Named)
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
fn parse_fixed_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = s.split_at(1);
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    let seconds = hours * 3600 + minutes * 60;
    if sign == "-" {
        FixedOffset::west_opt(seconds)
    } else {
        FixedOffset::east_opt(seconds)
    }
}

/// A schedule ready to compute fire times.
#[derive(Debug, Clone)]
pub struct ParsedSchedule {
    pub normalized: String,
    pub cron: Cron,
    pub zone: ScheduleZone,
}

impl ParsedSchedule {
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self, SchedulerError> {
        let normalized = normalize_schedule(expression)?;
        let cron = normalized
            .parse::<Cron>()
            .map_err(|e| SchedulerError::InvalidSchedule(format!("'{expression}': {e}")))?;
        let zone = parse_timezone(timezone)?;
        Ok(Self {
            normalized,
            cron,
            zone,
        })
    }

    /// First fire time strictly after `after`, evaluated in the schedule's zone.
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.zone {
            ScheduleZone::Utc => self.cron.find_next_occurrence(&after, false).ok(),
            ScheduleZone::Named(tz) => self
                .cron
                .find_next_occurrence(&after.with_timezone(&tz), false)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            ScheduleZone::Fixed(offset) => self
                .cron
                .find_next_occurrence(&after.with_timezone(&offset), false)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Check a cron expression and timezone without scheduling anything.
pub fn validate_schedule(expression: &str, timezone: Option<&str>) -> Result<(), SchedulerError> {
    ParsedSchedule::parse(expression, timezone).map(|_| ())
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Snapshot of one scheduled workflow, as returned by `list_scheduled_workflows`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledWorkflowInfo {
    pub workflow_id: String,
    pub cron_expression: String,
    pub timezone: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
}

struct ScheduleEntry {
    /// Distinguishes this entry's timer from one it replaced.
    generation: u64,
    info: ScheduledWorkflowInfo,
    cancel: CancellationToken,
}

/// Runs one timer task per scheduled workflow.
pub struct CronScheduler {
    launcher: Arc<dyn WorkflowLauncher>,
    entries: Arc<DashMap<String, ScheduleEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CronScheduler {
    pub fn new(launcher: Arc<dyn WorkflowLauncher>) -> Self {
        Self {
            launcher,
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Register (or replace) the schedule for a workflow.
    ///
    /// Returns `Ok(true)` when the timer is armed and `Ok(false)` when the
    /// schedule is disabled: it is listed but never fires. Malformed
    /// expressions and unknown zones are rejected here, never at fire time.
    pub fn schedule_workflow(
        &self,
        workflow_id: &str,
        schedule: &ScheduleConfig,
    ) -> Result<bool, SchedulerError> {
        let parsed = ParsedSchedule::parse(&schedule.cron_expression, schedule.timezone.as_deref())?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let armed = schedule.enabled && !self.shutdown.is_cancelled();
        let info = ScheduledWorkflowInfo {
            workflow_id: workflow_id.to_string(),
            cron_expression: schedule.cron_expression.clone(),
            timezone: schedule.timezone.clone(),
            next_run: if armed { parsed.next_run(Utc::now()) } else { None },
            last_run: None,
            enabled: schedule.enabled,
        };

        let previous = self.entries.insert(
            workflow_id.to_string(),
            ScheduleEntry {
                generation,
                info,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        if armed {
            self.tracker.spawn(run_timer(
                workflow_id.to_string(),
                generation,
                parsed,
                Arc::clone(&self.entries),
                Arc::clone(&self.launcher),
                cancel,
            ));
        }

        tracing::info!(
            %workflow_id,
            cron = %schedule.cron_expression,
            enabled = schedule.enabled,
            "workflow scheduled"
        );
        Ok(armed)
    }

    /// Cancel a workflow's timer. Returns whether an entry existed.
    pub fn unschedule_workflow(&self, workflow_id: &str) -> bool {
        match self.entries.remove(workflow_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                tracing::info!(%workflow_id, "workflow unscheduled");
                true
            }
            None => false,
        }
    }

    /// Every registered schedule, sorted by workflow id.
    pub fn list_scheduled_workflows(&self) -> Vec<ScheduledWorkflowInfo> {
        let mut list: Vec<ScheduledWorkflowInfo> =
            self.entries.iter().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        list
    }

    /// Cancel every timer and wait for the timer tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.entries.clear();
        tracing::info!("cron scheduler stopped");
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_timer(
    workflow_id: String,
    generation: u64,
    schedule: ParsedSchedule,
    entries: Arc<DashMap<String, ScheduleEntry>>,
    launcher: Arc<dyn WorkflowLauncher>,
    cancel: CancellationToken,
) {
    let mut after = Utc::now();
    loop {
        let Some(next) = schedule.next_run(after) else {
            tracing::warn!(%workflow_id, "schedule has no future fire times");
            break;
        };
        update_entry(&entries, &workflow_id, generation, |info| info.next_run = Some(next));

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let fired_at = Utc::now();
        update_entry(&entries, &workflow_id, generation, |info| info.last_run = Some(fired_at));
        tracing::debug!(%workflow_id, scheduled_for = %next, "cron trigger fired");

        match launcher
            .launch(&workflow_id, serde_json::json!({}), TriggerSource::Schedule)
            .await
        {
            Ok(execution_id) => {
                tracing::info!(%workflow_id, %execution_id, "scheduled execution started");
            }
            Err(e) => {
                tracing::warn!(%workflow_id, error = %e, "scheduled launch failed");
            }
        }

        after = next.max(Utc::now());
    }
}

fn update_entry(
    entries: &DashMap<String, ScheduleEntry>,
    workflow_id: &str,
    generation: u64,
    apply: impl FnOnce(&mut ScheduledWorkflowInfo),
) {
    if let Some(mut entry) = entries.get_mut(workflow_id) {
        if entry.generation == generation {
            apply(&mut entry.info);
        }
    }
}
