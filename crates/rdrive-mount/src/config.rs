//! Cache and buffering settings.

use crate::write_buffer::DEFAULT_SPOOL_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default TTL for directory listings.
pub const DEFAULT_DIR_TTL: Duration = Duration::from_secs(30);

/// Default TTL for single-entry metadata.
pub const DEFAULT_META_TTL: Duration = Duration::from_secs(60);

/// Default maximum number of entries per cache.
pub const DEFAULT_MAX_ENTRIES: u64 = 50_000;

/// Settings for the metadata and directory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored.
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub dir_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub meta_ttl: Duration,

    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir_ttl: DEFAULT_DIR_TTL,
            meta_ttl: DEFAULT_META_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn dir_ttl(mut self, ttl: Duration) -> Self {
        self.dir_ttl = ttl;
        self
    }

    #[must_use]
    pub fn meta_ttl(mut self, ttl: Duration) -> Self {
        self.meta_ttl = ttl;
        self
    }
}

/// Settings for per-handle write buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffers larger than this many bytes are spooled to disk.
    pub spool_threshold: u64,

    /// Directory for spool files; the system temp dir when unset.
    pub spool_dir: Option<PathBuf>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            spool_dir: None,
        }
    }
}

impl BufferConfig {
    #[must_use]
    pub fn spool_threshold(mut self, bytes: u64) -> Self {
        self.spool_threshold = bytes;
        self
    }

    #[must_use]
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }
}
