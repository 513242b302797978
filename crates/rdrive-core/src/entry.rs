//! Directory entries as reported by a backend.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Attribute bits carried alongside each entry.
///
/// The values mirror the attribute words host filesystem drivers expect, so
/// adapters can pass them through without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryAttributes(u32);

impl EntryAttributes {
    pub const READONLY: u32 = 0x0001;
    pub const HIDDEN: u32 = 0x0002;
    pub const DIRECTORY: u32 = 0x0010;
    pub const NORMAL: u32 = 0x0080;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Default attributes for a file or directory.
    pub fn for_kind(is_directory: bool) -> Self {
        if is_directory {
            Self(Self::DIRECTORY)
        } else {
            Self(Self::NORMAL)
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    #[must_use]
    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }
}

/// Immutable snapshot of one remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Final path component.
    pub name: String,
    pub is_directory: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub attributes: EntryAttributes,
}

impl RemoteEntry {
    /// Builds a file entry with matching creation and modification times.
    pub fn file(name: impl Into<String>, size: u64, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size,
            created: modified,
            modified,
            attributes: EntryAttributes::for_kind(false),
        }
    }

    /// Builds a directory entry.
    pub fn directory(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
            size: 0,
            created: modified,
            modified,
            attributes: EntryAttributes::for_kind(true),
        }
    }

    /// Synthesized entry for the backend root, which most protocols cannot stat.
    pub fn root() -> Self {
        Self::directory("/", SystemTime::UNIX_EPOCH)
    }

    #[must_use]
    pub fn with_created(mut self, created: SystemTime) -> Self {
        self.created = created;
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: EntryAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_attributes() {
        let file = RemoteEntry::file("a.txt", 5, SystemTime::UNIX_EPOCH);
        assert!(file.attributes.contains(EntryAttributes::NORMAL));
        assert!(!file.attributes.contains(EntryAttributes::DIRECTORY));

        let dir = RemoteEntry::directory("a", SystemTime::UNIX_EPOCH);
        assert!(dir.attributes.contains(EntryAttributes::DIRECTORY));
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_with_bit() {
        let attrs = EntryAttributes::for_kind(false).with(EntryAttributes::READONLY);
        assert!(attrs.contains(EntryAttributes::READONLY));
        assert!(attrs.contains(EntryAttributes::NORMAL));
    }
}
