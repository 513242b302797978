//! Persisted path-to-identifier cache for id-addressed backends.
//!
//! Entries expire after a TTL and are dropped eagerly on any observed rename
//! or delete (including everything below a renamed or deleted directory).
//! The map is written to disk as JSON on [`PathIdCache::save`] and when the
//! cache is dropped.

use crate::path::RemotePath;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Default lifetime of a resolved identifier.
pub const DEFAULT_PATH_ID_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedId {
    id: String,
    resolved_at: SystemTime,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CachedId>,
    dirty: bool,
}

/// Path → opaque id map with TTL and subtree invalidation.
#[derive(Debug)]
pub struct PathIdCache {
    file: Option<PathBuf>,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl PathIdCache {
    /// Loads the cache from `file`. A missing or unreadable file starts empty.
    pub fn load(file: impl Into<PathBuf>, ttl: Duration) -> Self {
        let file = file.into();
        let entries = match fs::read(&file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(file = %file.display(), error = %e, "Discarding corrupt path-id cache");
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Cannot read path-id cache");
                HashMap::new()
            }
        };
        debug!(file = %file.display(), entries = entries.len(), "Loaded path-id cache");
        Self {
            file: Some(file),
            ttl,
            inner: Mutex::new(Inner {
                entries,
                dirty: false,
            }),
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            file: None,
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the cached id if present and not expired.
    pub fn get(&self, path: &RemotePath) -> Option<String> {
        let mut inner = self.inner.lock();
        let cached = inner.entries.get(path.as_str())?;
        let fresh = cached
            .resolved_at
            .elapsed()
            .is_ok_and(|age| age < self.ttl);
        if fresh {
            return Some(cached.id.clone());
        }
        inner.entries.remove(path.as_str());
        inner.dirty = true;
        None
    }

    pub fn insert(&self, path: &RemotePath, id: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.entries.insert(
            path.as_str().to_string(),
            CachedId {
                id: id.into(),
                resolved_at: SystemTime::now(),
            },
        );
        inner.dirty = true;
    }

    pub fn invalidate(&self, path: &RemotePath) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(path.as_str()).is_some() {
            inner.dirty = true;
        }
    }

    /// Drops `path` and every cached descendant.
    pub fn invalidate_subtree(&self, path: &RemotePath) {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|key, _| !RemotePath::new(key).starts_with(path));
        if inner.entries.len() != before {
            inner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the map to disk if it changed since the last save.
    pub fn save(&self) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }
        write_atomic(file, &inner.entries)?;
        inner.dirty = false;
        Ok(())
    }
}

impl Drop for PathIdCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to persist path-id cache");
        }
    }
}

fn write_atomic(file: &Path, entries: &HashMap<String, CachedId>) -> io::Result<()> {
    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, entries)?;
    tmp.persist(file).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = PathIdCache::in_memory(DEFAULT_PATH_ID_TTL);
        let path = RemotePath::new("/docs/a.txt");
        assert!(cache.get(&path).is_none());
        cache.insert(&path, "id-a");
        assert_eq!(cache.get(&path).as_deref(), Some("id-a"));
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = PathIdCache::in_memory(Duration::ZERO);
        let path = RemotePath::new("/a");
        cache.insert(&path, "id");
        assert!(cache.get(&path).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_subtree_respects_component_boundaries() {
        let cache = PathIdCache::in_memory(DEFAULT_PATH_ID_TTL);
        cache.insert(&RemotePath::new("/dir"), "1");
        cache.insert(&RemotePath::new("/dir/child"), "2");
        cache.insert(&RemotePath::new("/dir/child/deep"), "3");
        cache.insert(&RemotePath::new("/dirt"), "4");

        cache.invalidate_subtree(&RemotePath::new("/dir"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&RemotePath::new("/dirt")).as_deref(), Some("4"));
    }

    #[test]
    fn test_persisted_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ids.json");
        {
            let cache = PathIdCache::load(&file, DEFAULT_PATH_ID_TTL);
            cache.insert(&RemotePath::new("/photos"), "folder-1");
            cache.save().unwrap();
        }
        let reloaded = PathIdCache::load(&file, DEFAULT_PATH_ID_TTL);
        assert_eq!(reloaded.get(&RemotePath::new("/photos")).as_deref(), Some("folder-1"));
    }

    #[test]
    fn test_drop_persists_unsaved_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ids.json");
        {
            let cache = PathIdCache::load(&file, DEFAULT_PATH_ID_TTL);
            cache.insert(&RemotePath::new("/x"), "x-id");
        }
        let reloaded = PathIdCache::load(&file, DEFAULT_PATH_ID_TTL);
        assert_eq!(reloaded.get(&RemotePath::new("/x")).as_deref(), Some("x-id"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ids.json");
        fs::write(&file, b"{not json").unwrap();
        let cache = PathIdCache::load(&file, DEFAULT_PATH_ID_TTL);
        assert!(cache.is_empty());
    }
}
