//! Bounded exponential backoff for transient delivery failures.

use std::time::Duration;

use rand::Rng;

/// How often and how patiently a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Jitter factor: the delay is randomized by +/- this fraction.
const JITTER_FACTOR: f64 = 0.25;

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first
    /// failure is `delay_for(1, ..)`).
    ///
    /// A provider-supplied `retry_after` wins when it is longer than the
    /// computed backoff, and is never cut short by `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(attempt, retry_after, jitter)
    }

    /// Same as [`delay_for`](Self::delay_for) with an explicit jitter in `[0, 1)`.
    pub fn delay_with_jitter(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter: f64,
    ) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
        let base_us = (self.base_delay.as_micros() as f64 * exp).min(self.max_delay.as_micros() as f64);
        let offset = (jitter * 2.0 - 1.0) * base_us * JITTER_FACTOR;
        let backoff = Duration::from_micros((base_us + offset).max(0.0) as u64);

        match retry_after {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}
