//! Error taxonomy shared by every backend.
//!
//! Each backend adapter translates its protocol-specific failures (FTP reply
//! codes, SFTP status codes, HTTP statuses) into [`RemoteError`]. Callers
//! only ever branch on [`ErrorKind`], which decides whether a failure is a
//! semantic outcome, something worth retrying, or grounds for suspending the
//! backend entirely.

use std::io;
use thiserror::Error;

/// Semantic class of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The path does not exist on the backend.
    NotFound,
    /// The backend refused the operation.
    AccessDenied,
    /// The target path is already taken.
    AlreadyExists,
    /// Directory removal refused because it still has children.
    NotEmpty,
    /// Connection dropped or the service answered with a transient failure.
    Transient,
    /// The operation did not complete within its deadline.
    Timeout,
    /// The backend ran out of space for this account.
    QuotaExceeded,
    /// Authentication or trust failure. Never retried.
    Fatal,
}

impl ErrorKind {
    /// Returns a human-readable name for this error kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AccessDenied => "AccessDenied",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotEmpty => "NotEmpty",
            Self::Transient => "Transient",
            Self::Timeout => "Timeout",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::Fatal => "Fatal",
        }
    }
}

/// A failure reported by a backend or by the session manager.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("'{path}' not found")]
    NotFound { path: String },

    #[error("access denied for '{path}'")]
    AccessDenied { path: String },

    #[error("'{path}' already exists")]
    AlreadyExists { path: String },

    #[error("directory '{path}' is not empty")]
    NotEmpty { path: String },

    #[error("connection lost: {reason}")]
    Disconnected { reason: String },

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("storage quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("host key for {host} does not match the trusted fingerprint (expected {expected}, got {actual})")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("backend suspended after fatal error: {reason}")]
    Suspended { reason: String },

    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RemoteError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::AccessDenied { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::NotEmpty { path: path.into() }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn quota(reason: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            reason: reason.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Classifies this error into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotEmpty { .. } => ErrorKind::NotEmpty,
            Self::Disconnected { .. } => ErrorKind::Transient,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::AuthenticationFailed { .. }
            | Self::HostKeyMismatch { .. }
            | Self::Suspended { .. } => ErrorKind::Fatal,
            Self::Io(e) => io_error_kind(e),
        }
    }

    /// Transient failures and timeouts are worth another attempt.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// True when the session that produced this error can no longer be trusted.
    #[inline]
    pub fn poisons_session(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Fatal
        )
    }
}

/// Classifies a local I/O error (spool files, persisted caches).
pub fn io_error_kind(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::DirectoryNotEmpty => ErrorKind::NotEmpty,
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => ErrorKind::QuotaExceeded,
        _ => ErrorKind::Transient,
    }
}

/// Result type for backend operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_errors_are_not_retryable() {
        for err in [
            RemoteError::not_found("/a"),
            RemoteError::access_denied("/a"),
            RemoteError::already_exists("/a"),
            RemoteError::not_empty("/a"),
            RemoteError::quota("full"),
        ] {
            assert!(!err.is_retryable(), "{err} should not be retried");
            assert!(!err.poisons_session(), "{err} should keep the session");
        }
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(RemoteError::disconnected("reset").is_retryable());
        assert!(RemoteError::timeout("list").is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        let mismatch = RemoteError::HostKeyMismatch {
            host: "example.org:22".into(),
            expected: "SHA256:aaa".into(),
            actual: "SHA256:bbb".into(),
        };
        assert_eq!(mismatch.kind(), ErrorKind::Fatal);
        assert!(!mismatch.is_retryable());
        assert!(RemoteError::auth("bad password").is_fatal());
    }

    #[test]
    fn test_io_error_classification() {
        let err = RemoteError::from(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let err = RemoteError::from(io::Error::other("boom"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
