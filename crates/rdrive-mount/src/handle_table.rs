//! Concurrent table of open file handles.
//!
//! Handles are numbered from 1 (0 is the "no handle" value hosts pass for
//! directory operations). Lookups hand out clones of the stored value, which
//! is expected to be a cheap shared pointer such as `Arc<Mutex<_>>`, so
//! no map shard lock is ever held across a network call.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe `u64 → V` map with auto-incrementing ids.
///
/// ```
/// use rdrive_mount::HandleTable;
/// use std::sync::Arc;
///
/// let table: HandleTable<Arc<String>> = HandleTable::new();
/// let fh = table.insert(Arc::new("/docs/a.txt".to_string()));
/// assert_eq!(table.get(fh).as_deref().map(String::as_str), Some("/docs/a.txt"));
/// assert!(table.remove(fh).is_some());
/// assert!(table.get(fh).is_none());
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V: Clone> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores `value` under a fresh, non-zero id.
    pub fn insert(&self, value: V) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // Wrapped around
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(value);
                return id;
            }
        }
    }

    /// A clone of the value stored under `id`.
    pub fn get(&self, id: u64) -> Option<V> {
        self.handles.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Removes and returns every handle.
    pub fn drain(&self) -> Vec<(u64, V)> {
        let ids: Vec<u64> = self.handles.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.handles.remove(&id))
            .collect()
    }
}

impl<V: Clone> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
