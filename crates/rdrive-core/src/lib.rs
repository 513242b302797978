//! Remote storage backends for rdrive.
//!
//! This crate holds everything between the filesystem bridge and the wire:
//!
//! ## Capability contract
//!
//! - [`RemoteSession`] - One authenticated connection (list, stat, ranged or
//!   whole-object reads, whole-object writes, namespace operations)
//! - [`Connector`] - Opens sessions against one endpoint
//! - [`RemoteError`] / [`ErrorKind`] - Shared failure taxonomy
//! - [`RemotePath`] / [`RemoteEntry`] - Normalized paths and entry snapshots
//!
//! ## Connection management
//!
//! - [`SessionPool`] - Bounded per-backend pool with health probes, retry with
//!   jittered exponential [`Backoff`], and suspension on Fatal errors
//! - [`SessionRegistry`] - One shared pool per [`BackendId`]
//! - [`TokenManager`] - Single-flight OAuth refresh
//! - [`KnownHosts`] - Trust-on-first-use host key store
//!
//! ## Adapters
//!
//! - [`ftp`] - FTP over `suppaftp` (whole-object reads only)
//! - [`sftp`] - SFTP over `russh`/`russh-sftp`
//! - [`gdrive`] - Drive v3 REST with a persisted path-id cache
//! - [`testing`] - In-memory backend with fault injection, for tests
//!
//! # Example
//!
//! ```
//! use rdrive_core::testing::{MemoryConnector, MemoryStore};
//! use rdrive_core::{ConnectionConfig, RemotePath, SessionPool};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new();
//! store.put_file("/docs/readme.txt", b"hello");
//!
//! let pool = SessionPool::new(Arc::new(MemoryConnector::new(store)), ConnectionConfig::default());
//! let entries = pool
//!     .run("list", |session| session.list(&RemotePath::new("/docs")))
//!     .unwrap();
//! assert_eq!(entries[0].name, "readme.txt");
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod entry;
pub mod error;
pub mod ftp;
pub mod gdrive;
pub mod known_hosts;
pub mod path;
pub mod pool;
pub mod retry;
pub mod sftp;
pub mod testing;

pub use auth::{Credentials, OAuthTokens, TokenManager};
pub use backend::{BackendId, BackendKind, Connector, ReadTarget, RemoteSession, UploadSource};
pub use config::ConnectionConfig;
pub use entry::{EntryAttributes, RemoteEntry};
pub use error::{ErrorKind, RemoteError, RemoteResult};
pub use known_hosts::KnownHosts;
pub use path::RemotePath;
pub use pool::{KeepaliveHandle, PoolStats, PooledSession, SessionPool, SessionRegistry};
pub use retry::Backoff;
