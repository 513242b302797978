//! Exponential backoff with jitter.

use crate::config::ConnectionConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// The nominal delay for attempt `n` (zero-based) is `base * 2^n`, capped at
/// `max`. The actual delay is drawn uniformly from the upper half of the
/// nominal delay so concurrent retries spread out without ever collapsing to
/// zero.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max, config.retry_attempts)
    }

    /// Total attempts allowed, first try included.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Nominal (jitter-free) delay after the given failed attempt.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        let half = nominal / 2;
        let spread = u64::try_from((nominal - half).as_micros()).unwrap_or(u64::MAX);
        if spread == 0 {
            return nominal;
        }
        half + Duration::from_micros(rand::rng().random_range(0..=spread))
    }
}
