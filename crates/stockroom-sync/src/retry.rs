//! # Retry Policy
//!
//! Exponential backoff for transient remote failures.
//!
//! ```text
//! attempt:   1      2      3      4      5 (max_retries)
//! delay:    ~1s    ~2s    ~4s    ~8s    → failed
//!           (±50% jitter, capped at max_backoff)
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};

use crate::config::QueueSettings;

/// How often and how patiently a transiently failing mutation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which the entry is marked `failed`.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_settings(&QueueSettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        RetryPolicy {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
        }
    }

    /// Returns true once `attempts` failed attempts use up the budget.
    pub fn exhausted(&self, attempts: i64) -> bool {
        attempts >= i64::from(self.max_retries)
    }

    /// Delay before the next attempt, after `attempts` failed ones.
    pub fn delay_for(&self, attempts: i64) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let mut backoff = self.create_backoff();
        let mut delay = self.initial_backoff;
        for _ in 0..attempts.max(1) {
            match backoff.next_backoff() {
                Some(next) => delay = next,
                None => break,
            }
        }
        delay.min(self.max_backoff)
    }

    /// Wall-clock time before which the entry must not run again.
    pub fn next_attempt_at(&self, attempts: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        offset(now, self.delay_for(attempts))
    }

    /// Same as [`next_attempt_at`](Self::next_attempt_at) but no earlier than
    /// a server-requested delay. The requested delay is capped at
    /// `max_backoff`.
    pub fn retry_after_at(
        &self,
        attempts: i64,
        requested: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = self
            .delay_for(attempts)
            .max(requested.min(self.max_backoff));
        offset(now, delay)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// `now + delay`, saturating at the latest representable time.
fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
