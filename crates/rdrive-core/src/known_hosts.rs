//! Trust-on-first-use host key store.
//!
//! The first fingerprint seen for a `host:port` is recorded and persisted;
//! later connections must present the same fingerprint. A mismatch is a
//! Fatal [`RemoteError::HostKeyMismatch`], which suspends the backend until
//! the stale entry is removed with [`KnownHosts::forget`].
//!
//! The file holds one `host:port fingerprint` pair per line. Blank lines and
//! lines starting with `#` are ignored.

use crate::error::{RemoteError, RemoteResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of a successful host key check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTrust {
    /// The fingerprint matched the recorded one.
    Known,
    /// First contact; the fingerprint has been recorded.
    Learned,
}

/// Persistent `host:port → fingerprint` map.
#[derive(Debug)]
pub struct KnownHosts {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KnownHosts {
    /// Loads the store from `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn host_key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Checks `fingerprint` for `host`, learning it on first contact.
    pub fn verify(&self, host: &str, fingerprint: &str) -> RemoteResult<HostTrust> {
        let mut entries = self.entries.lock();
        match entries.get(host) {
            Some(expected) if expected == fingerprint => Ok(HostTrust::Known),
            Some(expected) => {
                warn!(host, expected = %expected, actual = fingerprint, "Host key mismatch");
                Err(RemoteError::HostKeyMismatch {
                    host: host.to_string(),
                    expected: expected.clone(),
                    actual: fingerprint.to_string(),
                })
            }
            None => {
                entries.insert(host.to_string(), fingerprint.to_string());
                if let Some(path) = &self.path {
                    persist(path, &entries)?;
                }
                info!(host, fingerprint, "Trusting new host key");
                Ok(HostTrust::Learned)
            }
        }
    }

    /// Drops the recorded fingerprint for `host`, resetting trust.
    pub fn forget(&self, host: &str) -> io::Result<bool> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(host).is_some();
        if removed && let Some(path) = &self.path {
            persist(path, &entries)?;
        }
        Ok(removed)
    }

    pub fn fingerprint(&self, host: &str) -> Option<String> {
        self.entries.lock().get(host).cloned()
    }
}

fn parse(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .collect()
}

/// Writes the store atomically (temp file in the same directory, then rename).
fn persist(path: &Path, entries: &BTreeMap<String, String>) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    writeln!(tmp, "# rdrive known hosts (trust on first use)")?;
    for (host, fingerprint) in entries {
        writeln!(tmp, "{host} {fingerprint}")?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
