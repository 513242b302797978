//! Normalized remote paths.

use std::fmt;

/// Absolute, normalized path on a remote backend.
///
/// Remote paths always start with `/`, use `/` as the separator, never end
/// with a trailing slash (except the root itself) and contain no `.` or `..`
/// components. Host-side paths (Windows separators, duplicate slashes,
/// relative segments) are folded into this form by [`RemotePath::new`], so
/// two spellings of the same location share cache entries and locks.
///
/// # Examples
///
/// ```
/// use rdrive_core::RemotePath;
///
/// let path = RemotePath::new("\\docs\\\\reports/./q3.txt");
/// assert_eq!(path.as_str(), "/docs/reports/q3.txt");
/// assert_eq!(path.file_name(), Some("q3.txt"));
/// assert_eq!(path.parent().unwrap().as_str(), "/docs/reports");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    /// The root path (`/`).
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalizes a host path into remote form.
    pub fn new(path: impl AsRef<str>) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.as_ref().split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Self::root();
        }
        let mut normalized = String::with_capacity(path.as_ref().len() + 1);
        for part in parts {
            normalized.push('/');
            normalized.push_str(part);
        }
        Self(normalized)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins a single child name onto this path.
    pub fn join(&self, name: impl AsRef<str>) -> Self {
        if self.is_root() {
            Self::new(format!("/{}", name.as_ref()))
        } else {
            Self::new(format!("{}/{}", self.0, name.as_ref()))
        }
    }

    /// Returns the parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Returns the final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Iterates over the path components from the root down.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// True if `self` equals `ancestor` or lives beneath it.
    pub fn starts_with(&self, ancestor: &RemotePath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// Rewrites the `from` prefix of this path to `to`.
    ///
    /// Returns `None` if this path is not under `from`.
    pub fn rebase(&self, from: &RemotePath, to: &RemotePath) -> Option<RemotePath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[..]
        } else {
            &self.0[from.0.len()..]
        };
        Some(Self::new(format!("{}{}", to.0, rest)))
    }
}

impl Default for RemotePath {
    fn default() -> Self {
        Self::root()
    }
}

impl AsRef<str> for RemotePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Normalizing an already-normalized path is a no-op.
        #[test]
        fn normalization_is_idempotent(raw in "[a-z/\\\\.]{0,40}") {
            let once = RemotePath::new(&raw);
            let twice = RemotePath::new(once.as_str());
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.as_str().starts_with('/'));
            prop_assert!(once.is_root() || !once.as_str().ends_with('/'));
        }

        /// parent().join(file_name()) reconstructs the path.
        #[test]
        fn parent_join_roundtrip(parts in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let path = RemotePath::new(parts.join("/"));
            let parent = path.parent().unwrap();
            let name = path.file_name().unwrap();
            prop_assert_eq!(parent.join(name), path);
        }
    }
}
