//! In-memory backend with fault injection and call accounting.
//!
//! [`MemoryStore`] holds a tree of files and directories that any number of
//! [`MemorySession`]s operate on, exactly like several connections to the
//! same server. Tests use it to:
//!
//! - seed remote state ([`MemoryStore::put_file`], [`MemoryStore::put_dir`])
//! - count backend calls per operation ([`MemoryStore::calls`])
//! - inject failures ([`MemoryStore::fail_next`])
//! - watch how many sessions are alive at once ([`MemoryStore::max_live_sessions`])
//!
//! # Example
//!
//! ```
//! use rdrive_core::testing::{MemoryConnector, MemoryStore, Op};
//! use rdrive_core::{ConnectionConfig, ErrorKind, RemotePath, SessionPool};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new();
//! store.put_file("/hello.txt", b"hi");
//! store.fail_next(Op::Stat, ErrorKind::NotFound, 1);
//!
//! let pool = SessionPool::new(Arc::new(MemoryConnector::new(store.clone())), ConnectionConfig::default());
//! let err = pool.run("stat", |s| s.stat(&RemotePath::new("/hello.txt"))).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::NotFound);
//! assert_eq!(store.calls(Op::Stat), 1);
//! ```

use crate::backend::{BackendId, BackendKind, Connector, RemoteSession, UploadSource};
use crate::entry::RemoteEntry;
use crate::error::{ErrorKind, RemoteError, RemoteResult};
use crate::path::RemotePath;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// Backend operations that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    List,
    Stat,
    ReadRange,
    ReadFull,
    WriteFull,
    CreateEmpty,
    Delete,
    Mkdir,
    Rmdir,
    Rename,
    Probe,
}

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        created: SystemTime,
        modified: SystemTime,
    },
    Dir {
        created: SystemTime,
    },
}

impl Node {
    fn entry(&self, name: &str) -> RemoteEntry {
        match self {
            Node::File {
                data,
                created,
                modified,
            } => RemoteEntry::file(name, data.len() as u64, *modified).with_created(*created),
            Node::Dir { created } => RemoteEntry::directory(name, *created),
        }
    }
}

/// Shared remote state behind every [`MemorySession`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<RemotePath, Node>>,
    faults: Mutex<HashMap<Op, VecDeque<ErrorKind>>>,
    calls: Mutex<HashMap<Op, u64>>,
    latency: Mutex<Duration>,
    delays: Mutex<HashMap<Op, Duration>>,
    live_sessions: AtomicUsize,
    max_live_sessions: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = RemotePath::new(path);
        let mut nodes = self.nodes.lock();
        Self::ensure_parents(&mut nodes, &path);
        let now = SystemTime::now();
        nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                created: now,
                modified: now,
            },
        );
    }

    /// Creates a directory and any missing parents.
    pub fn put_dir(&self, path: &str) {
        let path = RemotePath::new(path);
        if path.is_root() {
            return;
        }
        let mut nodes = self.nodes.lock();
        Self::ensure_parents(&mut nodes, &path);
        nodes.entry(path).or_insert(Node::Dir {
            created: SystemTime::now(),
        });
    }

    fn ensure_parents(nodes: &mut BTreeMap<RemotePath, Node>, path: &RemotePath) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.is_root() {
                break;
            }
            parent = dir.parent();
            nodes.entry(dir).or_insert(Node::Dir {
                created: SystemTime::now(),
            });
        }
    }

    /// Contents of a file, if it exists.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&RemotePath::new(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = RemotePath::new(path);
        path.is_root() || self.nodes.lock().contains_key(&path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = RemotePath::new(path);
        path.is_root() || matches!(self.nodes.lock().get(&path), Some(Node::Dir { .. }))
    }

    /// Fails the next `times` calls of `op` with an error of `kind`.
    pub fn fail_next(&self, op: Op, kind: ErrorKind, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(kind, times));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Adds a fixed delay to every operation.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Holds `op` for `delay` after it has read the store, so its result
    /// is already stale if another session mutates meanwhile.
    pub fn delay_after(&self, op: Op, delay: Duration) {
        self.delays.lock().insert(op, delay);
    }

    fn linger(&self, op: Op) {
        let delay = self.delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: Op) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    pub fn max_live_sessions(&self) -> usize {
        self.max_live_sessions.load(Ordering::SeqCst)
    }

    /// Counts the call, applies latency and returns an injected fault if one is queued.
    fn enter(&self, op: Op, path: &RemotePath) -> RemoteResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let fault = self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match fault {
            Some(kind) => Err(injected(kind, path)),
            None => Ok(()),
        }
    }

    fn session_opened(&self) {
        let live = self.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_sessions.fetch_max(live, Ordering::SeqCst);
    }

    fn session_closed(&self) {
        self.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn require_dir(nodes: &BTreeMap<RemotePath, Node>, path: &RemotePath) -> RemoteResult<()> {
        if path.is_root() || matches!(nodes.get(path), Some(Node::Dir { .. })) {
            Ok(())
        } else {
            Err(RemoteError::not_found(path.as_str()))
        }
    }

    fn require_parent(nodes: &BTreeMap<RemotePath, Node>, path: &RemotePath) -> RemoteResult<()> {
        match path.parent() {
            Some(parent) => Self::require_dir(nodes, &parent),
            None => Err(RemoteError::access_denied(path.as_str())),
        }
    }

    fn has_children(nodes: &BTreeMap<RemotePath, Node>, path: &RemotePath) -> bool {
        nodes
            .keys()
            .any(|k| k != path && k.starts_with(path))
    }
}

fn injected(kind: ErrorKind, path: &RemotePath) -> RemoteError {
    let path = path.as_str();
    match kind {
        ErrorKind::NotFound => RemoteError::not_found(path),
        ErrorKind::AccessDenied => RemoteError::access_denied(path),
        ErrorKind::AlreadyExists => RemoteError::already_exists(path),
        ErrorKind::NotEmpty => RemoteError::not_empty(path),
        ErrorKind::Transient => RemoteError::disconnected("injected connection reset"),
        ErrorKind::Timeout => RemoteError::timeout("injected timeout"),
        ErrorKind::QuotaExceeded => RemoteError::quota("injected quota"),
        ErrorKind::Fatal => RemoteError::auth("injected credential rejection"),
    }
}

/// Connector producing sessions over a shared [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    ranged: bool,
    name: String,
}

impl MemoryConnector {
    /// Sessions advertise ranged reads.
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            ranged: true,
            name: "memory".to_string(),
        }
    }

    /// Sessions require whole-object fetches, like FTP.
    #[must_use]
    pub fn without_range_reads(mut self) -> Self {
        self.ranged = false;
        self
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl Connector for MemoryConnector {
    fn identity(&self) -> BackendId {
        BackendId::new(BackendKind::Memory, self.name.clone(), 0, "test")
    }

    fn connect(&self) -> RemoteResult<Box<dyn RemoteSession>> {
        self.store.enter(Op::Connect, &RemotePath::root())?;
        self.store.session_opened();
        Ok(Box::new(MemorySession {
            store: Arc::clone(&self.store),
            ranged: self.ranged,
        }))
    }
}

/// One "connection" to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    ranged: bool,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.session_closed();
    }
}

impl RemoteSession for MemorySession {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn list(&mut self, path: &RemotePath) -> RemoteResult<Vec<RemoteEntry>> {
        self.store.enter(Op::List, path)?;
        let entries = {
            let nodes = self.store.nodes.lock();
            MemoryStore::require_dir(&nodes, path)?;
            nodes
                .iter()
                .filter(|(k, _)| k.parent().as_ref() == Some(path))
                .filter_map(|(k, node)| k.file_name().map(|name| node.entry(name)))
                .collect()
        };
        self.store.linger(Op::List);
        Ok(entries)
    }

    fn stat(&mut self, path: &RemotePath) -> RemoteResult<RemoteEntry> {
        self.store.enter(Op::Stat, path)?;
        if path.is_root() {
            return Ok(RemoteEntry::root());
        }
        let entry = match (self.store.nodes.lock().get(path), path.file_name()) {
            (Some(node), Some(name)) => node.entry(name),
            _ => return Err(RemoteError::not_found(path.as_str())),
        };
        self.store.linger(Op::Stat);
        Ok(entry)
    }

    fn supports_range_read(&self) -> bool {
        self.ranged
    }

    fn read_range(&mut self, path: &RemotePath, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        self.store.enter(Op::ReadRange, path)?;
        let nodes = self.store.nodes.lock();
        match nodes.get(path) {
            Some(Node::File { data, .. }) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Node::Dir { .. }) => Err(RemoteError::access_denied(path.as_str())),
            None => Err(RemoteError::not_found(path.as_str())),
        }
    }

    fn read_full(&mut self, path: &RemotePath, sink: &mut dyn Write) -> RemoteResult<u64> {
        self.store.enter(Op::ReadFull, path)?;
        let data = match self.store.nodes.lock().get(path) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Dir { .. }) => return Err(RemoteError::access_denied(path.as_str())),
            None => return Err(RemoteError::not_found(path.as_str())),
        };
        self.store.linger(Op::ReadFull);
        sink.write_all(&data)?;
        Ok(data.len() as u64)
    }

    fn write_full(
        &mut self,
        path: &RemotePath,
        source: &mut dyn UploadSource,
        len: u64,
    ) -> RemoteResult<()> {
        self.store.enter(Op::WriteFull, path)?;
        let mut data = Vec::new();
        source.take(len).read_to_end(&mut data)?;

        let mut nodes = self.store.nodes.lock();
        MemoryStore::require_parent(&nodes, path)?;
        let now = SystemTime::now();
        match nodes.get_mut(path) {
            Some(Node::Dir { .. }) => Err(RemoteError::access_denied(path.as_str())),
            Some(Node::File {
                data: existing,
                modified,
                ..
            }) => {
                *existing = data;
                *modified = now;
                Ok(())
            }
            None => {
                nodes.insert(
                    path.clone(),
                    Node::File {
                        data,
                        created: now,
                        modified: now,
                    },
                );
                Ok(())
            }
        }
    }

    fn create_empty(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.store.enter(Op::CreateEmpty, path)?;
        let mut nodes = self.store.nodes.lock();
        MemoryStore::require_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(RemoteError::already_exists(path.as_str()));
        }
        let now = SystemTime::now();
        nodes.insert(
            path.clone(),
            Node::File {
                data: Vec::new(),
                created: now,
                modified: now,
            },
        );
        Ok(())
    }

    fn delete(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.store.enter(Op::Delete, path)?;
        let mut nodes = self.store.nodes.lock();
        match nodes.get(path) {
            Some(Node::File { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(RemoteError::access_denied(path.as_str())),
            None => Err(RemoteError::not_found(path.as_str())),
        }
    }

    fn mkdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.store.enter(Op::Mkdir, path)?;
        let mut nodes = self.store.nodes.lock();
        if path.is_root() || nodes.contains_key(path) {
            return Err(RemoteError::already_exists(path.as_str()));
        }
        MemoryStore::require_parent(&nodes, path)?;
        nodes.insert(
            path.clone(),
            Node::Dir {
                created: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn rmdir(&mut self, path: &RemotePath) -> RemoteResult<()> {
        self.store.enter(Op::Rmdir, path)?;
        let mut nodes = self.store.nodes.lock();
        if path.is_root() {
            return Err(RemoteError::access_denied(path.as_str()));
        }
        match nodes.get(path) {
            Some(Node::Dir { .. }) if MemoryStore::has_children(&nodes, path) => {
                Err(RemoteError::not_empty(path.as_str()))
            }
            Some(Node::Dir { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::File { .. }) => Err(RemoteError::access_denied(path.as_str())),
            None => Err(RemoteError::not_found(path.as_str())),
        }
    }

    fn rename(&mut self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        self.store.enter(Op::Rename, from)?;
        let mut nodes = self.store.nodes.lock();
        if !nodes.contains_key(from) {
            return Err(RemoteError::not_found(from.as_str()));
        }
        if nodes.contains_key(to) || to.is_root() {
            return Err(RemoteError::already_exists(to.as_str()));
        }
        MemoryStore::require_parent(&nodes, to)?;
        if to.starts_with(from) {
            return Err(RemoteError::access_denied(to.as_str()));
        }
        let moved: Vec<RemotePath> = nodes.keys().filter(|k| k.starts_with(from)).cloned().collect();
        for old in moved {
            if let (Some(node), Some(new)) = (nodes.remove(&old), old.rebase(from, to)) {
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn probe(&mut self) -> RemoteResult<()> {
        self.store.enter(Op::Probe, &RemotePath::root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn session(store: &Arc<MemoryStore>) -> Box<dyn RemoteSession> {
        MemoryConnector::new(Arc::clone(store)).connect().unwrap()
    }

    #[test]
    fn test_list_orders_children_and_skips_grandchildren() {
        let store = MemoryStore::new();
        store.put_file("/a/z.txt", b"z");
        store.put_file("/a/b.txt", b"bb");
        store.put_file("/a/sub/deep.txt", b"d");
        let mut s = session(&store);

        let names: Vec<_> = s
            .list(&RemotePath::new("/a"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b.txt", "sub", "z.txt"]);
    }

    #[test]
    fn test_rmdir_refuses_non_empty() {
        let store = MemoryStore::new();
        store.put_file("/a/b.txt", b"x");
        let mut s = session(&store);

        let err = s.rmdir(&RemotePath::new("/a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotEmpty);
        assert!(store.contains("/a/b.txt"));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let store = MemoryStore::new();
        store.put_file("/a/b/c.txt", b"c");
        let mut s = session(&store);

        s.rename(&RemotePath::new("/a"), &RemotePath::new("/x")).unwrap();
        assert_eq!(store.file("/x/b/c.txt"), Some(b"c".to_vec()));
        assert!(!store.contains("/a"));
    }

    #[test]
    fn test_write_full_replaces_content() {
        let store = MemoryStore::new();
        store.put_file("/f", b"old content");
        let mut s = session(&store);

        let mut src = Cursor::new(b"new".to_vec());
        s.write_full(&RemotePath::new("/f"), &mut src, 3).unwrap();
        assert_eq!(store.file("/f"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_injected_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.put_dir("/d");
        store.fail_next(Op::List, ErrorKind::Timeout, 1);
        let mut s = session(&store);

        assert_eq!(
            s.list(&RemotePath::new("/d")).unwrap_err().kind(),
            ErrorKind::Timeout
        );
        assert!(s.list(&RemotePath::new("/d")).is_ok());
        assert_eq!(store.calls(Op::List), 2);
    }

    #[test]
    fn test_live_session_tracking() {
        let store = MemoryStore::new();
        let a = session(&store);
        let b = session(&store);
        assert_eq!(store.live_sessions(), 2);
        drop(a);
        drop(b);
        assert_eq!(store.live_sessions(), 0);
        assert_eq!(store.max_live_sessions(), 2);
    }
}
