//! The virtual filesystem bridge.
//!
//! [`RemoteFs`] turns host intents (path-based lookups, handle-based I/O)
//! into calls on a [`SessionPool`], keeping a [`MetadataCache`] in front of
//! the backend and one [`WriteBuffer`] per written handle.
//!
//! # Locking
//!
//! Mutations on a path (create, delete, mkdir, rmdir, rename, flush) hold
//! that path's entry in [`PathLocks`] for the duration of the backend call.
//! When a handle mutex is also needed it is taken *after* the path lock.
//! Reads and buffered writes only touch the handle mutex, so they never wait
//! on unrelated paths.
//!
//! A handle's path lives in a side table rather than behind its mutex, so a
//! rename rebases open handles without waiting on their transfers.
//!
//! Lookups that miss the cache read the backend unlocked and insert with a
//! [`CacheEpoch`](rdrive_mount::CacheEpoch) taken beforehand, so a result
//! that raced a mutation is never cached.
//!
//! # Conflicts
//!
//! Two dirty handles on the same path each upload their full buffer when
//! flushed. Uploads are serialized by the path lock and the later one
//! replaces the earlier one (last flush wins).

use crate::error::{FsError, FsResult};
use crate::handles::{HandlePhase, OpenHandle, OpenMode};
use dashmap::DashMap;
use parking_lot::Mutex;
use rdrive_core::{ErrorKind, RemoteEntry, RemoteError, RemotePath, SessionPool};
use rdrive_mount::{BufferConfig, BufferMode, CacheConfig, HandleTable, MetadataCache, PathLocks, TransferStats, WriteBuffer};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

type SharedHandle = Arc<Mutex<OpenHandle>>;

/// Where an open handle points.
#[derive(Debug, Clone)]
struct HandleLocation {
    path: RemotePath,
    /// Buffered size once the handle holds local changes.
    buffered: Option<u64>,
}

/// What statfs reports for the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub capacity_bytes: u64,
    /// Remote quotas are not queried, so this equals the capacity.
    pub free_bytes: u64,
}

/// Filesystem view of one backend.
pub struct RemoteFs {
    pool: Arc<SessionPool>,
    cache: MetadataCache,
    handles: HandleTable<SharedHandle>,
    locks: PathLocks,
    buffer: BufferConfig,
    stats: TransferStats,
    /// Path and buffered size of every open handle, by fh. Lets getattr
    /// and rename work without taking handle mutexes.
    locations: DashMap<u64, HandleLocation>,
    volume: VolumeInfo,
}

impl RemoteFs {
    pub fn new(pool: Arc<SessionPool>, cache: CacheConfig, buffer: BufferConfig) -> Self {
        let label = pool.identity().to_string();
        Self {
            pool,
            cache: MetadataCache::new(cache),
            handles: HandleTable::new(),
            locks: PathLocks::new(),
            buffer,
            stats: TransferStats::new(),
            locations: DashMap::new(),
            volume: VolumeInfo {
                label,
                capacity_bytes: crate::config::DEFAULT_CAPACITY,
                free_bytes: crate::config::DEFAULT_CAPACITY,
            },
        }
    }

    #[must_use]
    pub fn with_volume(mut self, label: impl Into<String>, capacity_bytes: u64) -> Self {
        self.volume = VolumeInfo {
            label: label.into(),
            capacity_bytes,
            free_bytes: capacity_bytes,
        };
        self
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn transfer_stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn volume_info(&self) -> VolumeInfo {
        self.volume.clone()
    }

    /// Number of open handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Lifecycle phase of an open handle.
    pub fn handle_phase(&self, fh: u64) -> Option<HandlePhase> {
        self.handles.get(fh).map(|shared| shared.lock().phase())
    }

    /// Resolves `name` inside `parent`, rejecting names that are not a single
    /// path component.
    pub fn child_path(parent: &RemotePath, name: &str) -> FsResult<RemotePath> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(FsError::InvalidName(name.to_string()));
        }
        Ok(parent.join(name))
    }

    // ------------------------------------------------------------------
    // Namespace reads
    // ------------------------------------------------------------------

    /// Children of `dir`, from the cache when fresh.
    pub fn list(&self, dir: &RemotePath) -> FsResult<Arc<Vec<RemoteEntry>>> {
        trace!(path = %dir, "list");
        if let Some(listing) = self.cache.get_listing(dir) {
            debug!(path = %dir, count = listing.len(), "Listing cache hit");
            return Ok(listing);
        }
        let epoch = self.cache.epoch(dir);
        let children = self.pool.run("list", |session| session.list(dir))?;
        debug!(path = %dir, count = children.len(), "Listing cache miss, fetched");
        Ok(self.cache.put_listing_since(dir, children, &epoch))
    }

    /// Metadata for `path`. Sizes of files with buffered writes reflect the
    /// buffer, not the remote object.
    pub fn get_attributes(&self, path: &RemotePath) -> FsResult<RemoteEntry> {
        trace!(path = %path, "get_attributes");
        let mut entry = if path.is_root() {
            RemoteEntry::root()
        } else if let Some(entry) = self.cache.get_entry(path) {
            debug!(path = %path, "Metadata cache hit");
            entry
        } else {
            let epoch = self.cache.epoch(path);
            let entry = self.pool.run("stat", |session| session.stat(path))?;
            debug!(path = %path, size = entry.size, "Metadata cache miss, fetched");
            self.cache.put_entry_since(path, entry.clone(), &epoch);
            entry
        };
        if !entry.is_directory
            && let Some(size) = self.buffered_size(path)
        {
            entry.size = size;
        }
        Ok(entry)
    }

    fn buffered_size(&self, path: &RemotePath) -> Option<u64> {
        self.locations
            .iter()
            .filter(|slot| &slot.value().path == path)
            .filter_map(|slot| slot.value().buffered)
            .max()
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    fn new_buffer(&self, for_create: bool) -> WriteBuffer {
        let threshold = self.buffer.spool_threshold;
        let buffer = if for_create {
            WriteBuffer::new_for_create(threshold)
        } else {
            WriteBuffer::new(threshold)
        };
        match &self.buffer.spool_dir {
            Some(dir) => buffer.with_spool_dir(dir.clone()),
            None => buffer,
        }
    }

    fn handle(&self, fh: u64) -> FsResult<SharedHandle> {
        self.handles.get(fh).ok_or(FsError::InvalidHandle(fh))
    }

    fn insert_handle(&self, path: &RemotePath, handle: OpenHandle) -> u64 {
        let buffered = handle.is_dirty().then(|| handle.size());
        let fh = self.handles.insert(Arc::new(Mutex::new(handle)));
        self.locations.insert(
            fh,
            HandleLocation {
                path: path.clone(),
                buffered,
            },
        );
        fh
    }

    /// Current path of an open handle, renames included.
    fn path_of(&self, fh: u64) -> FsResult<RemotePath> {
        self.locations
            .get(&fh)
            .map(|location| location.path.clone())
            .ok_or(FsError::InvalidHandle(fh))
    }

    fn note_buffered(&self, fh: u64, size: u64) {
        if let Some(mut location) = self.locations.get_mut(&fh) {
            location.buffered = Some(size);
        }
    }

    /// Opens an existing file. Nothing is downloaded until the first read
    /// (non-ranged backends) or the first write.
    ///
    /// With `truncate`, the handle starts from an empty buffer and the
    /// existing content is never fetched.
    pub fn open(&self, path: &RemotePath, write: bool, truncate: bool) -> FsResult<u64> {
        trace!(path = %path, write, truncate, "open");
        let epoch = self.cache.epoch(path);
        let target = self.pool.run("open", |session| session.open_for_read(path))?;
        if target.entry.is_directory {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        self.cache.put_entry_since(path, target.entry.clone(), &epoch);

        let handle = match (write, truncate) {
            (true, true) => OpenHandle::new_object(self.new_buffer(true), target.ranged),
            (true, false) => OpenHandle::existing(OpenMode::Write, target.entry.size, target.ranged),
            (false, _) => OpenHandle::existing(OpenMode::Read, target.entry.size, target.ranged),
        };
        let fh = self.insert_handle(path, handle);
        debug!(path = %path, fh, ranged = target.ranged, "Opened handle");
        Ok(fh)
    }

    /// Creates an empty object and opens it for writing.
    pub fn create(&self, path: &RemotePath) -> FsResult<(u64, RemoteEntry)> {
        trace!(path = %path, "create");
        let ranged = {
            let _guard = self.locks.lock(path);
            let ranged = self.pool.run("create", |session| {
                session.create_empty(path)?;
                Ok(session.supports_range_read())
            })?;
            self.cache.invalidate(path);
            ranged
        };
        let name = path.file_name().unwrap_or_default();
        let entry = RemoteEntry::file(name, 0, SystemTime::now());
        let fh = self.insert_handle(path, OpenHandle::new_object(self.new_buffer(true), ranged));
        debug!(path = %path, fh, "Created object");
        Ok((fh, entry))
    }

    /// Locks a handle, rejecting one that was closed while we waited.
    fn lock_open<'h>(fh: u64, shared: &'h SharedHandle) -> FsResult<parking_lot::MutexGuard<'h, OpenHandle>> {
        let handle = shared.lock();
        if handle.is_closed() {
            return Err(FsError::InvalidHandle(fh));
        }
        Ok(handle)
    }

    /// The handle's local copy, fetching the whole object first if needed.
    fn loaded<'h>(&self, fh: u64, handle: &'h mut OpenHandle) -> FsResult<&'h mut WriteBuffer> {
        if !handle.is_loaded() {
            let buffer = self.download(&self.path_of(fh)?)?;
            handle.install(buffer);
        }
        handle.content_mut().ok_or(FsError::InvalidHandle(fh))
    }

    fn download(&self, path: &RemotePath) -> FsResult<WriteBuffer> {
        let mut buffer = self.new_buffer(false);
        let bytes = self.pool.run("download", |session| {
            // A retried attempt starts over
            buffer.clear()?;
            session.read_full(path, &mut buffer.appender())
        })?;
        self.stats.record_download(bytes);
        if buffer.mode() == BufferMode::Spooled {
            self.stats.record_spill();
        }
        debug!(path = %path, bytes, mode = ?buffer.mode(), "Fetched whole object");
        Ok(buffer)
    }

    /// Reads up to `size` bytes at `offset`.
    ///
    /// Ranged backends are asked for exactly that window. Otherwise the first
    /// read fetches the whole object and later reads are served locally.
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        trace!(fh, offset, size, "read");
        let shared = self.handle(fh)?;
        let mut handle = Self::lock_open(fh, &shared)?;

        let data = if handle.ranged() && !handle.is_loaded() {
            drop(handle);
            let path = self.path_of(fh)?;
            let data = self
                .pool
                .run("read", |session| session.read_range(&path, offset, size))?;
            self.stats.record_download(data.len() as u64);
            // Closed while the request was in flight
            if shared.lock().is_closed() {
                return Err(FsError::InvalidHandle(fh));
            }
            data
        } else {
            self.loaded(fh, &mut handle)?.read(offset, size)?
        };
        self.stats.record_read(data.len());
        Ok(data)
    }

    /// Applies a write to the handle's buffer. No network traffic unless this
    /// is the first write to an existing object, which downloads it first.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        trace!(fh, offset, len = data.len(), "write");
        let shared = self.handle(fh)?;
        let mut handle = Self::lock_open(fh, &shared)?;
        if !handle.is_writable() {
            return Err(FsError::ReadOnlyHandle(fh));
        }

        let buffer = self.loaded(fh, &mut handle)?;
        let before = buffer.mode();
        let written = buffer.write(offset, data)?;
        if before == BufferMode::Memory && buffer.mode() == BufferMode::Spooled {
            self.stats.record_spill();
            debug!(fh, size = buffer.len(), "Write buffer spooled to disk");
        }
        handle.note_write();
        self.note_buffered(fh, handle.size());
        self.stats.record_write(written);
        Ok(written)
    }

    /// Truncates or extends the handle's content to `size` bytes.
    pub fn set_size(&self, fh: u64, size: u64) -> FsResult<()> {
        trace!(fh, size, "set_size");
        let shared = self.handle(fh)?;
        let mut handle = Self::lock_open(fh, &shared)?;
        if !handle.is_writable() {
            return Err(FsError::ReadOnlyHandle(fh));
        }
        if size == 0 && !handle.is_loaded() {
            let buffer = self.new_buffer(true);
            handle.install(buffer);
        } else {
            self.loaded(fh, &mut handle)?.truncate(size)?;
        }
        handle.note_write();
        self.note_buffered(fh, handle.size());
        Ok(())
    }

    /// Path-based truncate: open, resize, close.
    pub fn truncate(&self, path: &RemotePath, size: u64) -> FsResult<()> {
        let fh = self.open(path, true, size == 0)?;
        let result = self.set_size(fh, size).and_then(|()| self.close(fh));
        if result.is_err() {
            self.abandon(fh);
        }
        result
    }

    /// Uploads the handle's buffer if it is dirty.
    ///
    /// On failure the buffer is kept and the handle stays `Dirty`, so the
    /// flush (or close) can be retried.
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        trace!(fh, "flush");
        let shared = self.handle(fh)?;
        loop {
            if !shared.lock().is_dirty() {
                return Ok(());
            }
            let path = self.path_of(fh)?;

            let _guard = self.locks.lock(&path);
            if self.path_of(fh)? != path {
                // Renamed between reading the path and taking its lock
                continue;
            }
            let mut handle = shared.lock();
            if !handle.is_dirty() {
                return Ok(());
            }
            return self.upload(fh, &path, &mut handle);
        }
    }

    /// Caller holds the lock on `path` and the handle mutex.
    fn upload(&self, fh: u64, path: &RemotePath, handle: &mut OpenHandle) -> FsResult<()> {
        let Some(buffer) = handle.content_mut() else {
            return Ok(());
        };
        let len = buffer.len();
        let result = self.pool.run("flush", |session| {
            let mut source = buffer.upload_source()?;
            session.write_full(path, &mut source, len)
        });

        match result {
            Ok(()) => {
                handle.mark_flushed();
                self.stats.record_upload(len);
                self.cache.invalidate(path);
                debug!(path = %path, fh, bytes = len, "Flushed handle");
                Ok(())
            }
            Err(e) => {
                handle.mark_upload_failed();
                self.stats.record_upload_failure();
                warn!(path = %path, fh, bytes = len, error = %e, "Upload failed, buffer retained");
                Err(e.into())
            }
        }
    }

    /// Flushes and releases a handle.
    ///
    /// If the final upload fails the handle stays open (and `Dirty`) and the
    /// error is returned; call `close` again to retry or
    /// [`abandon`](Self::abandon) to give up.
    pub fn close(&self, fh: u64) -> FsResult<()> {
        trace!(fh, "close");
        loop {
            self.flush(fh)?;
            let shared = self.handle(fh)?;
            let mut handle = shared.lock();
            if handle.is_dirty() {
                // A write slipped in after the flush
                continue;
            }
            self.handles.remove(fh);
            handle.close();
            if let Some((_, location)) = self.locations.remove(&fh) {
                debug!(path = %location.path, fh, "Closed handle");
            }
            return Ok(());
        }
    }

    /// Drops a handle without uploading. Returns the number of unsaved bytes
    /// that were discarded, or `None` if the handle did not exist.
    pub fn abandon(&self, fh: u64) -> Option<u64> {
        let shared = self.handles.remove(fh)?;
        let location = self.locations.remove(&fh).map(|(_, location)| location.path);
        let discarded = shared.lock().close();
        if discarded > 0 {
            warn!(path = ?location, fh, bytes = discarded, "Discarding unsaved buffer");
        }
        Some(discarded)
    }

    // ------------------------------------------------------------------
    // Namespace mutations
    // ------------------------------------------------------------------

    pub fn delete(&self, path: &RemotePath) -> FsResult<()> {
        trace!(path = %path, "delete");
        let _guard = self.locks.lock(path);
        self.pool.run("delete", |session| session.delete(path))?;
        self.cache.invalidate(path);
        debug!(path = %path, "Deleted");
        Ok(())
    }

    pub fn mkdir(&self, path: &RemotePath) -> FsResult<RemoteEntry> {
        trace!(path = %path, "mkdir");
        let _guard = self.locks.lock(path);
        self.pool.run("mkdir", |session| session.mkdir(path))?;
        self.cache.invalidate(path);
        debug!(path = %path, "Created directory");
        Ok(RemoteEntry::directory(path.file_name().unwrap_or_default(), SystemTime::now()))
    }

    /// Removes an empty directory. A non-empty one fails with `NotEmpty`
    /// and leaves the cache untouched.
    pub fn rmdir(&self, path: &RemotePath) -> FsResult<()> {
        trace!(path = %path, "rmdir");
        if path.is_root() {
            return Err(RemoteError::access_denied(path.as_str()).into());
        }
        let _guard = self.locks.lock(path);
        self.pool.run("rmdir", |session| session.rmdir(path))?;
        self.cache.invalidate_subtree(path);
        debug!(path = %path, "Removed directory");
        Ok(())
    }

    /// Renames `from` to `to`. Open handles under `from` follow the move.
    ///
    /// Without `replace` an existing target fails with `AlreadyExists`; with
    /// it the target is removed first (directories must be empty).
    pub fn rename(&self, from: &RemotePath, to: &RemotePath, replace: bool) -> FsResult<()> {
        trace!(from = %from, to = %to, replace, "rename");
        if from == to {
            return Ok(());
        }
        if from.is_root() || to.starts_with(from) {
            return Err(FsError::InvalidName(to.to_string()));
        }

        let _guard = self.locks.lock_many([from, to]);
        self.pool.run("rename", |session| {
            match session.stat(to) {
                Ok(_) if !replace => return Err(RemoteError::already_exists(to.as_str())),
                Ok(target) if target.is_directory => session.rmdir(to)?,
                Ok(_) => session.delete(to)?,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            session.rename(from, to)
        })?;

        self.cache.invalidate_subtree(from);
        self.cache.invalidate_subtree(to);
        self.rebase_handles(from, to);
        debug!(from = %from, to = %to, "Renamed");
        Ok(())
    }

    /// Moves open handles under `from` to `to`. Never touches handle
    /// mutexes, which may be held across a transfer.
    fn rebase_handles(&self, from: &RemotePath, to: &RemotePath) {
        for mut slot in self.locations.iter_mut() {
            if let Some(moved) = slot.value().path.rebase(from, to) {
                slot.value_mut().path = moved;
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Flushes and closes every remaining handle, then closes idle sessions.
    /// Returns how many handles could not be uploaded.
    pub fn shutdown(&self) -> usize {
        let mut failed = 0;
        for (fh, shared) in self.handles.drain() {
            let Some(path) = self.locations.get(&fh).map(|location| location.path.clone()) else {
                shared.lock().close();
                continue;
            };
            let mut handle = shared.lock();
            if handle.is_dirty() {
                drop(handle);
                let _guard = self.locks.lock(&path);
                handle = shared.lock();
                if self.upload(fh, &path, &mut handle).is_err() {
                    failed += 1;
                }
            }
            let discarded = handle.close();
            if discarded > 0 {
                warn!(path = %path, fh, bytes = discarded, "Unmounting with unsaved data");
            }
        }
        self.locations.clear();
        self.pool.shutdown();
        failed
    }
}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs")
            .field("backend", self.pool.identity())
            .field("handles", &self.handles.len())
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}
