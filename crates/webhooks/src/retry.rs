//! Retry backoff policy.
//!
//! One policy serves both consumers of backoff in the pipeline: the failure
//! queue (delays between redelivery attempts) and the CRM client (429/5xx
//! spacing). The formula is configuration, not structure.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay; attempt 1 waits this long.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0) applied as ±(jitter · delay).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy without jitter; delays are fully deterministic.
    pub fn without_jitter(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(base_delay, max_delay, 0.0)
    }

    /// Delay before the given attempt (1-indexed): `base · 2^(attempt-1)`,
    /// capped at `max_delay`, with deterministic jitter derived from the
    /// attempt number so tests stay reproducible.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi((attempt - 1).min(32) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter = if self.jitter > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            delay_ms * self.jitter * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let policy =
            RetryPolicy::without_jitter(Duration::from_millis(100), Duration::from_millis(450));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(450));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(450));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(
            RetryPolicy::default().delay_for_attempt(0),
            Duration::ZERO
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_secs(60),
            0.2,
        );

        for attempt in 1..=6 {
            let raw = 1000u64 * 2u64.pow(attempt - 1);
            let raw = raw.min(60_000);
            let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
            let band = (raw as f64 * 0.2) as u64;
            assert!(delay >= raw.saturating_sub(band) && delay <= raw + band);
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_attempt(u32::MAX);
        assert!(delay <= Duration::from_secs(66));
    }
}
