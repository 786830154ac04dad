//! Retry decision and backoff computation.
//!
//! Stateless: the queue manager asks `should_retry` after every failed
//! attempt and schedules the job again after `delay_for_attempt`.

use std::time::Duration;

use stepwise_types::job::{BackoffStrategy, RetryPolicy};

/// Stateless retry handler for failed job attempts.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    ///
    /// `max_retries` counts retries, so the total attempt budget is
    /// `max_retries + 1`.
    pub fn should_retry(policy: &RetryPolicy, attempts_made: u32) -> bool {
        attempts_made <= policy.max_retries
    }

    /// Delay before retry number `retry` (1-based), clamped to `max_delay`.
    ///
    /// - linear: `initial_delay * retry`
    /// - exponential: `initial_delay * 2^(retry - 1)`
    pub fn delay_for_attempt(policy: &RetryPolicy, retry: u32) -> Duration {
        let retry = retry.max(1);
        let millis = match policy.backoff_strategy {
            BackoffStrategy::Linear => policy.initial_delay.saturating_mul(u64::from(retry)),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(retry - 1).unwrap_or(u64::MAX);
                policy.initial_delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis.min(policy.max_delay))
    }
}
