use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for failed jobs.
///
/// Pure decision logic, no I/O and no clock of its own: the monitor loop
/// passes in the current time and compares against `eligible_at` instead of
/// ever sleeping on a delay.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_minutes: f64,
}

impl RetryPolicy {
    /// A job that has burned `attempt_count` attempts may go around again
    /// while the count is below the budget.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retries
    }

    /// Delay before the retry following failure number `attempt_count + 1`:
    /// `initial_delay * multiplier^attempt_count`.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let minutes = self.initial_delay_minutes * self.backoff_multiplier.powi(attempt_count as i32);
        let seconds = (minutes * 60.0).max(0.0);

        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Earliest instant a job that failed `attempt_count` times (most
    /// recently at `last_updated`) may be flipped back to PENDING.
    pub fn eligible_at(&self, attempt_count: u32, last_updated: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(attempt_count.saturating_sub(1));

        // out-of-range arithmetic means "effectively never"
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| last_updated.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
