//! Per-path mutual exclusion for mutating operations.
//!
//! Create, delete, rename and flush on the same normalized path are
//! serialized; disjoint paths never contend. Locks are created on demand and
//! pruned as soon as nobody holds or waits on them.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use rdrive_core::RemotePath;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<RemotePath, Arc<Mutex<()>>>,
}

/// Held locks for one or more paths; released on drop.
pub struct PathGuard<'a> {
    owner: &'a PathLocks,
    held: Vec<(RemotePath, ArcMutexGuard<RawMutex, ()>)>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &RemotePath) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(path.clone()).or_default().value())
    }

    /// Blocks until `path` is exclusively held.
    pub fn lock(&self, path: &RemotePath) -> PathGuard<'_> {
        self.lock_many([path])
    }

    /// Locks several paths at once, in sorted order so two callers locking
    /// overlapping sets cannot deadlock.
    pub fn lock_many<'p>(&self, paths: impl IntoIterator<Item = &'p RemotePath>) -> PathGuard<'_> {
        let mut sorted: Vec<RemotePath> = paths.into_iter().cloned().collect();
        sorted.sort();
        sorted.dedup();

        let held = sorted
            .into_iter()
            .map(|path| {
                let guard = Mutex::lock_arc(&self.slot(&path));
                (path, guard)
            })
            .collect();
        PathGuard { owner: self, held }
    }

    /// Number of lock slots currently allocated.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl PathGuard<'_> {
    pub fn paths(&self) -> impl Iterator<Item = &RemotePath> {
        self.held.iter().map(|(path, _)| path)
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        for (path, guard) in self.held.drain(..).rev() {
            drop(guard);
            // Only the map's own reference left: nobody holds or waits
            self.owner
                .locks
                .remove_if(&path, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_slots_are_pruned_after_release() {
        let locks = PathLocks::new();
        {
            let guard = locks.lock(&RemotePath::new("/a"));
            assert_eq!(guard.paths().count(), 1);
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_lock_many_dedups_and_sorts() {
        let locks = PathLocks::new();
        let b = RemotePath::new("/b");
        let a = RemotePath::new("/a");
        let guard = locks.lock_many([&b, &a, &b]);
        let held: Vec<_> = guard.paths().map(RemotePath::as_str).collect();
        assert_eq!(held, vec!["/a", "/b"]);
    }

    #[test]
    fn test_same_path_is_serialized() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = locks.lock(&RemotePath::new("/shared"));
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_disjoint_paths_do_not_block() {
        let locks = Arc::new(PathLocks::new());
        let _held = locks.lock(&RemotePath::new("/busy"));

        let other = Arc::clone(&locks);
        let worker = thread::spawn(move || {
            let _guard = other.lock(&RemotePath::new("/free"));
        });
        // Would hang if /free contended with /busy
        thread::sleep(Duration::from_millis(10));
        worker.join().unwrap();
    }

    #[test]
    fn test_opposite_order_rename_does_not_deadlock() {
        let locks = Arc::new(PathLocks::new());
        let a = RemotePath::new("/a");
        let b = RemotePath::new("/b");

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = if i % 2 == 0 {
                            locks.lock_many([&a, &b])
                        } else {
                            locks.lock_many([&b, &a])
                        };
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
