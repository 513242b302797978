//! Connection tuning for the session pool.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of pooled sessions per backend.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default number of attempts (first try included) for transient failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default first backoff delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default idle time after which a session is probed before reuse.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-operation network timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for connecting to and pooling sessions against one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum number of live sessions.
    pub pool_size: usize,

    /// Attempts per operation before a transient failure is surfaced.
    pub retry_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Idle sessions older than this are probed before reuse.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// How long a caller waits for a free session when the pool is full.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Network timeout for connecting and for each backend call.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            acquire_timeout: DEFAULT_OPERATION_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
