//! Mapping from remote failures to host error codes.
//!
//! [`RemoteErrorCategory`] sits between [`RemoteError`] and whatever the host
//! framework wants (a POSIX errno for FUSE). Host-side failures that never
//! reach a backend, such as a directory opened as a file, get their own
//! categories.

use rdrive_core::{ErrorKind, RemoteError};
use std::io;

/// Semantic category for a failed filesystem intent.
///
/// ```
/// use rdrive_core::RemoteError;
/// use rdrive_mount::RemoteErrorCategory;
///
/// let err = RemoteError::not_empty("/a");
/// let category = RemoteErrorCategory::from(&err);
///
/// assert_eq!(category, RemoteErrorCategory::NotEmpty);
/// assert_eq!(category.to_errno(), libc::ENOTEMPTY);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCategory {
    NotFound,
    AccessDenied,
    AlreadyExists,
    NotEmpty,
    /// Connection dropped after retries were exhausted.
    Transient,
    Timeout,
    QuotaExceeded,
    /// Authentication or host-key failure; the backend is suspended.
    Fatal,
    IsDirectory,
    NotDirectory,
    InvalidArgument,
    /// Local I/O failure (spool file, temp dir).
    IoError,
}

impl RemoteErrorCategory {
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AccessDenied => libc::EACCES,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Transient | Self::IoError => libc::EIO,
            Self::Timeout => libc::ETIMEDOUT,
            Self::QuotaExceeded => libc::ENOSPC,
            Self::Fatal => libc::EPERM,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::InvalidArgument => libc::EINVAL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AccessDenied => "AccessDenied",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotEmpty => "NotEmpty",
            Self::Transient => "Transient",
            Self::Timeout => "Timeout",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::Fatal => "Fatal",
            Self::IsDirectory => "IsDirectory",
            Self::NotDirectory => "NotDirectory",
            Self::InvalidArgument => "InvalidArgument",
            Self::IoError => "IoError",
        }
    }
}

impl From<ErrorKind> for RemoteErrorCategory {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::AccessDenied => Self::AccessDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::NotEmpty => Self::NotEmpty,
            ErrorKind::Transient => Self::Transient,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::QuotaExceeded => Self::QuotaExceeded,
            ErrorKind::Fatal => Self::Fatal,
        }
    }
}

impl From<&RemoteError> for RemoteErrorCategory {
    fn from(e: &RemoteError) -> Self {
        match e {
            // Local spool failures are not the backend's fault
            RemoteError::Io(source) => io_error_category(source),
            other => Self::from(other.kind()),
        }
    }
}

impl From<RemoteError> for RemoteErrorCategory {
    fn from(e: RemoteError) -> Self {
        Self::from(&e)
    }
}

impl From<&io::Error> for RemoteErrorCategory {
    fn from(e: &io::Error) -> Self {
        io_error_category(e)
    }
}

fn io_error_category(e: &io::Error) -> RemoteErrorCategory {
    match e.kind() {
        io::ErrorKind::NotFound => RemoteErrorCategory::NotFound,
        io::ErrorKind::PermissionDenied => RemoteErrorCategory::AccessDenied,
        io::ErrorKind::AlreadyExists => RemoteErrorCategory::AlreadyExists,
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => RemoteErrorCategory::QuotaExceeded,
        io::ErrorKind::TimedOut => RemoteErrorCategory::Timeout,
        io::ErrorKind::InvalidInput => RemoteErrorCategory::InvalidArgument,
        _ => RemoteErrorCategory::IoError,
    }
}

/// Raw OS error if there is one, otherwise `EIO`.
#[inline]
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_errno_mapping() {
        let cases = [
            (RemoteError::not_found("/a"), libc::ENOENT),
            (RemoteError::access_denied("/a"), libc::EACCES),
            (RemoteError::already_exists("/a"), libc::EEXIST),
            (RemoteError::not_empty("/a"), libc::ENOTEMPTY),
            (RemoteError::disconnected("reset"), libc::EIO),
            (RemoteError::timeout("list"), libc::ETIMEDOUT),
            (RemoteError::quota("full"), libc::ENOSPC),
            (RemoteError::auth("bad password"), libc::EPERM),
        ];
        for (err, errno) in cases {
            assert_eq!(RemoteErrorCategory::from(&err).to_errno(), errno, "{err}");
        }
    }

    #[test]
    fn test_host_key_mismatch_is_fatal() {
        let err = RemoteError::HostKeyMismatch {
            host: "h:22".into(),
            expected: "SHA256:a".into(),
            actual: "SHA256:b".into(),
        };
        assert_eq!(RemoteErrorCategory::from(err), RemoteErrorCategory::Fatal);
    }

    #[test]
    fn test_local_io_errors() {
        let full = RemoteError::from(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        assert_eq!(RemoteErrorCategory::from(&full), RemoteErrorCategory::QuotaExceeded);

        let other = io::Error::other("spool broke");
        assert_eq!(RemoteErrorCategory::from(&other), RemoteErrorCategory::IoError);
        assert_eq!(RemoteErrorCategory::from(&other).to_errno(), libc::EIO);
    }

    #[test]
    fn test_host_side_categories() {
        assert_eq!(RemoteErrorCategory::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(RemoteErrorCategory::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(RemoteErrorCategory::InvalidArgument.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_io_error_to_errno() {
        assert_eq!(io_error_to_errno(&io::Error::from_raw_os_error(libc::EACCES)), libc::EACCES);
        assert_eq!(io_error_to_errno(&io::Error::other("custom")), libc::EIO);
    }

    #[test]
    fn test_names() {
        assert_eq!(RemoteErrorCategory::QuotaExceeded.name(), "QuotaExceeded");
        assert_eq!(RemoteErrorCategory::from(ErrorKind::Fatal).name(), "Fatal");
    }
}
