//! Exponential backoff with jitter between command attempts.

use std::time::Duration;

use rand::Rng;

/// Delay before retry `n` is `base * 2^(n-1)`, capped at `max`, plus up to
/// 10% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// No waiting at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the given retry; retry 0 is the first attempt.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 || self.max.is_zero() {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow((retry - 1).min(16));
        let capped = self.base.saturating_mul(factor).min(self.max);

        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}
