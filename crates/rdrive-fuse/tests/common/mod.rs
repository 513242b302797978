//! Shared harness for bridge integration tests.
//!
//! Every test gets a [`RemoteFs`] over an in-memory backend with a small
//! spool threshold and millisecond backoff, so spooling and retry paths are
//! reached without large payloads or slow sleeps.

#![allow(dead_code)]

use rdrive_core::testing::{MemoryConnector, MemoryStore};
use rdrive_core::{ConnectionConfig, RemotePath, SessionPool};
use rdrive_fuse::RemoteFs;
use rdrive_mount::{BufferConfig, CacheConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Spool threshold used by the harness.
pub const TEST_THRESHOLD: u64 = 4096;

/// Read size used when reading whole files back.
pub const READ_CHUNK: usize = 1000;

pub fn p(path: &str) -> RemotePath {
    RemotePath::new(path)
}

pub struct TestFs {
    pub fs: RemoteFs,
    pub store: Arc<MemoryStore>,
    _spool: TempDir,
}

pub struct TestFsBuilder {
    store: Arc<MemoryStore>,
    ranged: bool,
    cache: CacheConfig,
    threshold: u64,
    connection: ConnectionConfig,
}

impl TestFsBuilder {
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn without_range_reads(mut self) -> Self {
        self.ranged = false;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.connection = self.connection.retry_attempts(attempts);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.connection = self.connection.pool_size(size);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.connection = self.connection.acquire_timeout(timeout);
        self
    }

    pub fn build(self) -> TestFs {
        let spool = TempDir::new().expect("spool dir");
        let mut connector = MemoryConnector::new(Arc::clone(&self.store));
        if !self.ranged {
            connector = connector.without_range_reads();
        }
        let pool = Arc::new(SessionPool::new(Arc::new(connector), self.connection));
        let buffer = BufferConfig::default()
            .spool_threshold(self.threshold)
            .spool_dir(spool.path());
        TestFs {
            fs: RemoteFs::new(pool, self.cache, buffer),
            store: self.store,
            _spool: spool,
        }
    }
}

impl TestFs {
    pub fn builder() -> TestFsBuilder {
        TestFsBuilder {
            store: MemoryStore::new(),
            ranged: true,
            cache: CacheConfig::default(),
            threshold: TEST_THRESHOLD,
            connection: ConnectionConfig::default()
                .pool_size(4)
                .backoff(Duration::from_millis(1), Duration::from_millis(4)),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn spool_dir(&self) -> &std::path::Path {
        self._spool.path()
    }

    /// Creates (or truncates) `path` and writes `data` through one handle.
    pub fn write_file(&self, path: &str, data: &[u8]) {
        let path = p(path);
        let fh = match self.fs.create(&path) {
            Ok((fh, _)) => fh,
            Err(_) => self.fs.open(&path, true, true).expect("open for truncate"),
        };
        self.write_all(fh, data);
        self.fs.close(fh).expect("close after write");
    }

    /// Writes `data` from offset 0 in transfer-sized chunks.
    pub fn write_all(&self, fh: u64, data: &[u8]) {
        let mut offset = 0;
        for chunk in data.chunks(READ_CHUNK * 3) {
            let written = self.fs.write(fh, offset as u64, chunk).expect("write");
            assert_eq!(written, chunk.len());
            offset += written;
        }
    }

    /// Reads `path` back through a fresh read handle.
    pub fn read_file(&self, path: &str) -> Vec<u8> {
        let fh = self.fs.open(&p(path), false, false).expect("open for read");
        let data = self.read_to_end(fh);
        self.fs.close(fh).expect("close after read");
        data
    }

    pub fn read_to_end(&self, fh: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = self.fs.read(fh, out.len() as u64, READ_CHUNK).expect("read");
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    pub fn names(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .fs
            .list(&p(dir))
            .expect("list")
            .iter()
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }
}
