//! Inode management for the FUSE filesystem.
//!
//! The kernel addresses files by inode number; backends address them by
//! path. [`InodeTable`] keeps the two in step, including across renames.

use dashmap::DashMap;
use rdrive_core::RemotePath;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    pub path: RemotePath,
    /// Lookup count for `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: RemotePath) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(1),
        }
    }

    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the lookup count. Returns `None` if it would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::SeqCst);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::SeqCst);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::SeqCst)
    }
}

/// Thread-safe bidirectional map between inode numbers and remote paths.
pub struct InodeTable {
    path_to_inode: DashMap<RemotePath, u64>,
    inode_to_entry: DashMap<u64, InodeEntry>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root directory pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_inode: DashMap::new(),
            inode_to_entry: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        let root = RemotePath::root();
        table.path_to_inode.insert(root.clone(), ROOT_INODE);
        table.inode_to_entry.insert(ROOT_INODE, InodeEntry::new(root));
        table
    }

    /// Returns the inode for `path`, allocating one if needed. Either way
    /// the lookup count goes up by one.
    pub fn get_or_insert(&self, path: RemotePath) -> u64 {
        if let Some(inode) = self.path_to_inode.get(&path) {
            let ino = *inode;
            if let Some(entry) = self.inode_to_entry.get(&ino) {
                entry.inc_nlookup();
            }
            return ino;
        }

        // entry() closes the race with a concurrent lookup of the same path
        let inode = self.path_to_inode.entry(path.clone()).or_insert_with(|| {
            let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
            self.inode_to_entry.insert(ino, InodeEntry::new(path));
            ino
        });
        *inode
    }

    /// Current path of an inode.
    pub fn path(&self, inode: u64) -> Option<RemotePath> {
        self.inode_to_entry.get(&inode).map(|entry| entry.path.clone())
    }

    pub fn get(&self, inode: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, InodeEntry>> {
        self.inode_to_entry.get(&inode)
    }

    pub fn get_inode(&self, path: &RemotePath) -> Option<u64> {
        self.path_to_inode.get(path).map(|r| *r)
    }

    /// Decrements the lookup count; evicts the inode when it reaches zero.
    /// Returns `true` if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        if let Some(entry) = self.inode_to_entry.get(&inode)
            && entry.dec_nlookup(nlookup) == Some(0)
        {
            drop(entry);
            return self.evict(inode);
        }
        false
    }

    fn evict(&self, inode: u64) -> bool {
        match self.inode_to_entry.remove(&inode) {
            Some((_, entry)) => {
                // The path may already belong to a newer inode
                self.path_to_inode.remove_if(&entry.path, |_, ino| *ino == inode);
                true
            }
            None => false,
        }
    }

    /// Unlinks `path` from its inode (after delete). The entry itself lives
    /// until the kernel forgets it.
    pub fn invalidate_path(&self, path: &RemotePath) {
        self.path_to_inode.remove(path);
    }

    /// Moves `from` and everything below it to `to`.
    ///
    /// Whatever inode previously sat at `to` is unlinked first.
    pub fn rename(&self, from: &RemotePath, to: &RemotePath) {
        self.invalidate_path(to);
        let moved: Vec<(u64, RemotePath, RemotePath)> = self
            .inode_to_entry
            .iter()
            .filter_map(|entry| {
                entry
                    .path
                    .rebase(from, to)
                    .map(|new_path| (*entry.key(), entry.path.clone(), new_path))
            })
            .collect();

        for (inode, old_path, new_path) in moved {
            self.path_to_inode.remove_if(&old_path, |_, ino| *ino == inode);
            self.path_to_inode.insert(new_path.clone(), inode);
            if let Some(mut entry) = self.inode_to_entry.get_mut(&inode) {
                entry.path = new_path;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_entry.len()
    }

    /// True if only the root inode is present.
    pub fn is_empty(&self) -> bool {
        self.inode_to_entry.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
