//! Exponential backoff for failed deliveries.
//!
//! A job that failed `n` times (counting the failure just recorded) waits
//! `base_delay * 2^(n-1)` capped at `max_delay`: 30s, 60s, 120s and so on
//! up to one hour with the defaults. Jitter is off by default so that the
//! schedule is predictable; enabling it spreads retries of a burst.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for rescheduled jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) applied after capping.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule at the given time.
    Retry {
        /// When the next delivery attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying.
    GiveUp {
        /// Why the job will not be retried
        reason: String,
    },
}

impl BackoffPolicy {
    /// Delay before the next attempt once `attempts` failures are recorded.
    ///
    /// `attempts` is 1-based; zero is treated as one.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let delay = self.base_delay.saturating_mul(multiplier);
        let capped = std::cmp::min(delay, self.max_delay);

        std::cmp::min(apply_jitter(capped, self.jitter_factor), self.max_delay)
    }

    /// Decides whether a job with `attempts` recorded failures gets another
    /// attempt, and when.
    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({max_attempts}) exceeded"),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempts)) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: failed_at + delay }
    }
}

/// Randomizes a delay by ±jitter_factor. A 0.25 factor turns 10s into
/// anything from 7.5s to 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
