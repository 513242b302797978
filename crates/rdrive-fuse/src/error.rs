//! Error handling and errno mapping for the bridge.

use rdrive_core::RemoteError;
use rdrive_mount::RemoteErrorCategory;
use std::io;
use thiserror::Error;

/// Failure of a filesystem intent.
#[derive(Debug, Error)]
pub enum FsError {
    /// The backend (or the session manager) reported a failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local spool or temp-file failure.
    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("invalid inode: {0}")]
    InvalidInode(u64),

    /// A write intent on a handle that was opened read-only.
    #[error("handle {0} is not open for writing")]
    ReadOnlyHandle(u64),

    #[error("'{0}' is a directory")]
    IsDirectory(String),

    #[error("'{0}' is not a directory")]
    NotDirectory(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),
}

impl FsError {
    pub fn category(&self) -> RemoteErrorCategory {
        RemoteErrorCategory::from(self)
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            Self::InvalidHandle(_) | Self::ReadOnlyHandle(_) => libc::EBADF,
            other => other.category().to_errno(),
        }
    }
}

impl From<&FsError> for RemoteErrorCategory {
    fn from(e: &FsError) -> Self {
        match e {
            FsError::Remote(remote) => Self::from(remote),
            FsError::Io(io) => Self::from(io),
            FsError::InvalidInode(_) => Self::NotFound,
            FsError::InvalidHandle(_) | FsError::ReadOnlyHandle(_) | FsError::InvalidName(_) => {
                Self::InvalidArgument
            }
            FsError::IsDirectory(_) => Self::IsDirectory,
            FsError::NotDirectory(_) => Self::NotDirectory,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_errors_keep_taxonomy() {
        assert_eq!(FsError::from(RemoteError::not_empty("/a")).to_errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::from(RemoteError::quota("full")).to_errno(), libc::ENOSPC);
        assert_eq!(FsError::from(RemoteError::timeout("read")).to_errno(), libc::ETIMEDOUT);
        assert_eq!(FsError::from(RemoteError::auth("denied")).to_errno(), libc::EPERM);
    }

    #[test]
    fn test_host_side_errors() {
        assert_eq!(FsError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert_eq!(FsError::ReadOnlyHandle(7).to_errno(), libc::EBADF);
        assert_eq!(FsError::InvalidInode(9).to_errno(), libc::ENOENT);
        assert_eq!(FsError::IsDirectory("/d".into()).to_errno(), libc::EISDIR);
        assert_eq!(FsError::NotDirectory("/f".into()).to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::InvalidName("a/b".into()).to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_spool_failure_is_eio() {
        let err = FsError::from(io::Error::other("spool"));
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(err.category(), RemoteErrorCategory::IoError);
    }
}
