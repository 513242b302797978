//! Host-neutral building blocks for mounting remote storage.
//!
//! Everything here is independent of the host driver framework. The FUSE
//! adapter in `rdrive-fuse` composes these pieces into its bridge.
//!
//! # Components
//!
//! - [`MetadataCache`] - TTL cache of directory listings and per-path entries
//! - [`WriteBuffer`] - per-handle read-modify-write buffer that spools to disk
//!   past a size threshold
//! - [`HandleTable`] - concurrent map of open handles with auto-incrementing ids
//! - [`PathLocks`] - per-path mutual exclusion for mutating operations
//! - [`RemoteErrorCategory`] - error classification and errno conversion
//! - [`stats`] - lock-free cache and transfer counters
//!
//! # Example
//!
//! ```
//! use rdrive_core::{RemoteEntry, RemotePath};
//! use rdrive_mount::{CacheConfig, MetadataCache, PathLocks, WriteBuffer};
//! use std::time::SystemTime;
//!
//! let cache = MetadataCache::new(CacheConfig::default());
//! let dir = RemotePath::new("/docs");
//! cache.put_listing(&dir, vec![RemoteEntry::file("a.txt", 5, SystemTime::now())]);
//! assert!(cache.get_entry(&dir.join("a.txt")).is_some());
//!
//! let locks = PathLocks::new();
//! let _guard = locks.lock(&dir.join("a.txt"));
//!
//! let mut buffer = WriteBuffer::new_for_create(1024);
//! buffer.write(0, b"hello").unwrap();
//! assert_eq!(buffer.len(), 5);
//! ```

pub mod cache;
pub mod config;
pub mod error_category;
pub mod handle_table;
pub mod path_locks;
pub mod stats;
pub mod testing;
pub mod write_buffer;

pub use cache::{CacheEpoch, CachedEntry, MetadataCache};
pub use config::{BufferConfig, CacheConfig};
pub use error_category::{RemoteErrorCategory, io_error_to_errno};
pub use handle_table::HandleTable;
pub use path_locks::{PathGuard, PathLocks};
pub use stats::{CacheStats, TransferStats};
pub use write_buffer::{Appender, BufferMode, DEFAULT_SPOOL_THRESHOLD, UploadReader, WriteBuffer};
