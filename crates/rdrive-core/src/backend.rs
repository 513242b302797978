//! The capability contract every remote storage backend implements.
//!
//! A backend is split in two halves:
//!
//! - [`Connector`]: knows how to reach the service and authenticate, and is
//!   shared by every thread of the mount.
//! - [`RemoteSession`]: one live, authenticated connection. Sessions are
//!   owned by the [`SessionPool`](crate::SessionPool) and lent to exactly one
//!   caller at a time, which is what makes concurrent use of the contract safe
//!   even though the underlying protocol clients are strictly sequential.
//!
//! Backends that address objects by opaque identifier instead of path (the
//! cloud drive) resolve paths internally; callers always speak [`RemotePath`].

use crate::entry::RemoteEntry;
use crate::error::{ErrorKind, RemoteResult};
use crate::path::RemotePath;
use std::fmt;
use std::io::{Read, Seek, Write};

/// The protocol family behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ftp,
    Sftp,
    Drive,
    Memory,
}

impl BackendKind {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::Drive => "gdrive",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Identity of a backend endpoint: protocol, host and the account used.
///
/// Two connectors with the same identity share a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId {
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl BackendId {
    pub fn new(kind: BackendKind, host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            user: user.into(),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}:{}", self.kind, self.user, self.host, self.port)
    }
}

/// A seekable byte source for whole-object uploads.
///
/// Uploads may be retried, so the source must be rewindable.
pub trait UploadSource: Read + Seek + Send {}

impl<T: Read + Seek + Send + ?Sized> UploadSource for T {}

/// Result of opening a remote object for reading.
#[derive(Debug, Clone)]
pub struct ReadTarget {
    pub entry: RemoteEntry,
    /// When false, the caller must fetch the whole object once with
    /// [`RemoteSession::read_full`] and serve offsets from that copy.
    pub ranged: bool,
}

/// One authenticated connection to a backend.
///
/// All operations are blocking. Implementations report failures through the
/// shared [`RemoteError`](crate::RemoteError) taxonomy so the pool can decide
/// whether to retry.
pub trait RemoteSession: Send {
    fn kind(&self) -> BackendKind;

    /// Lists the children of a directory, in backend order.
    fn list(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>>;

    fn stat(&mut self, path: &RemotePath) -> RemoteResult<RemoteEntry>;

    /// Whether [`read_range`](Self::read_range) is served natively.
    fn supports_range_read(&self) -> bool;

    /// Prepares a read, confirming the object exists.
    fn open_for_read(&mut self, path: &RemotePath) -> RemoteResult<ReadTarget> {
        let entry = self.stat(path)?;
        Ok(ReadTarget {
            entry,
            ranged: self.supports_range_read(),
        })
    }

    /// Reads up to `len` bytes at `offset`. Short reads only happen at EOF.
    fn read_range(&mut self, path: &RemotePath, offset: u64, len: usize) -> RemoteResult<Vec<u8>>;

    /// Streams the whole object into `sink`, returning the byte count.
    fn read_full(&mut self, path: &RemotePath, sink: &mut dyn Write) -> RemoteResult<u64>;

    /// Replaces the entire object with `len` bytes read from `source`.
    fn write_full(
        &mut self,
        path: &RemotePath,
        source: &mut dyn UploadSource,
        len: u64,
    ) -> RemoteResult<()>;

    fn create_empty(&mut self, path: &RemotePath) -> RemoteResult<()>;

    fn delete(&mut self, path: &RemotePath) -> RemoteResult<()>;

    fn mkdir(&mut self, path: &RemotePath) -> RemoteResult<()>;

    /// Removes an empty directory; fails `NotEmpty` otherwise.
    fn rmdir(&mut self, path: &RemotePath) -> RemoteResult<()>;

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()>;

    fn exists(&mut self, path: &RemotePath) -> RemoteResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cheap round trip used by keepalive to detect dead connections.
    fn probe(&mut self) -> RemoteResult<()>;

    /// Politely tears the connection down. Errors are ignored.
    fn close(&mut self) {}
}

/// Factory for sessions against one backend endpoint.
pub trait Connector: Send + Sync {
    fn identity(&self) -> BackendId;

    /// Opens and authenticates a new session.
    ///
    /// Credential and trust failures must be reported as Fatal errors so the
    /// pool stops reconnecting.
    fn connect(&self) -> RemoteResult<Box<dyn RemoteSession>>;
}
