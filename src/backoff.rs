use std::time::Duration;

use rand::Rng;

/// Exponential backoff between attempts of a retryable job.
///
/// The delay before attempt `n + 1` is `min(base * 2^(n - 1), max)` plus a jitter
/// drawn from `[0, jitter_ratio)` of that delay, and never more than `max`. With a
/// ratio below 1 the delays strictly increase until they reach the cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60 * 60),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// Panics if `base` is zero, if `max < base` or if `jitter_ratio` is not in `[0, 1)`.
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        assert!(!base.is_zero(), "Retry base delay must be greater than 0");
        assert!(max >= base, "Retry max delay must be at least the base delay");
        assert!(
            (0.0..1.0).contains(&jitter_ratio),
            "Retry jitter ratio must be in [0, 1)"
        );
        RetryPolicy {
            base,
            max,
            jitter_ratio,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: i32) -> Duration {
        let jitter = rand::rng().random::<f64>();
        self.delay_with_jitter(attempt, jitter)
    }

    /// `jitter` is a sample from `[0, 1)`, scaled by the jitter ratio.
    pub(crate) fn delay_with_jitter(&self, attempt: i32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        let delay = self
            .base
            .checked_mul(1 << exponent)
            .map_or(self.max, |d| d.min(self.max));
        let jittered = delay.mul_f64(1.0 + self.jitter_ratio * jitter.clamp(0.0, 1.0));
        jittered.min(self.max)
    }
}
