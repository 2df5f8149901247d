//! # Retry Policy
//!
//! Bounded exponential backoff for transient submission failures. Conflict
//! and validation failures never pass through here; the drainer marks those
//! failed immediately.

use crate::shared::now_rfc3339;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rand::Rng;
use std::time::Duration;

/// Backoff schedule for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the mutation is marked failed (first send included)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Jitter fraction applied to every delay (0.1 = +/- 10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` tries so far
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before attempt number `attempts + 1`, exponential and capped,
    /// with jitter so queued clients do not retry in lockstep
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            (capped * (1.0 + factor)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// Timestamp of the backoff gate after `attempts` tries
    pub fn next_attempt_at(&self, attempts: u32) -> String {
        let delay = self.delay_for(attempts);
        let delay = ChronoDuration::from_std(delay)
            .unwrap_or_else(|_| ChronoDuration::seconds(self.max_delay.as_secs() as i64));
        (Utc::now() + delay).to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Timestamp string for "now", used when comparing against backoff gates
pub fn backoff_now() -> String {
    now_rfc3339()
}
