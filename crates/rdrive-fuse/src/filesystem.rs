//! fuser `Filesystem` adapter.
//!
//! [`RdriveFs`] translates kernel requests into [`RemoteFs`] calls. Every
//! request that may touch the network runs on the [`WorkerPool`], so the
//! fuser session thread only parses requests and hands them off.

use crate::bridge::RemoteFs;
use crate::error::{FsError, FsResult};
use crate::inode::{InodeTable, ROOT_INODE};
use crate::workers::{Admission, WorkerPool};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use rdrive_core::{EntryAttributes, RemoteEntry, RemotePath};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 4096;

const DEFAULT_FILE_PERM: u16 = 0o644;
const DEFAULT_DIR_PERM: u16 = 0o755;
const READONLY_FILE_PERM: u16 = 0o444;

const MAX_NAME_LEN: u32 = 255;

#[cfg(target_os = "linux")]
const RENAME_NOREPLACE: u32 = libc::RENAME_NOREPLACE;
#[cfg(target_os = "macos")]
const RENAME_NOREPLACE: u32 = libc::RENAME_EXCL;

#[cfg(target_os = "linux")]
const RENAME_EXCHANGE: u32 = libc::RENAME_EXCHANGE;
#[cfg(target_os = "macos")]
const RENAME_EXCHANGE: u32 = libc::RENAME_SWAP;

/// Reply types that can carry an errno.
trait ErrorReply: Send + 'static {
    fn error(self, errno: c_int);
}

macro_rules! impl_error_reply {
    ($($reply:ty),* $(,)?) => {
        $(impl ErrorReply for $reply {
            fn error(self, errno: c_int) {
                <$reply>::error(self, errno);
            }
        })*
    };
}

impl_error_reply!(
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
);

/// State shared with worker threads.
struct Inner {
    fs: RemoteFs,
    inodes: InodeTable,
    attr_ttl: Duration,
    uid: u32,
    gid: u32,
    read_only: bool,
}

impl Inner {
    fn path_of(&self, ino: u64) -> FsResult<RemotePath> {
        self.inodes.path(ino).ok_or(FsError::InvalidInode(ino))
    }

    fn child_of(&self, parent: u64, name: &str) -> FsResult<RemotePath> {
        RemoteFs::child_path(&self.path_of(parent)?, name)
    }

    fn make_attr(&self, ino: u64, entry: &RemoteEntry) -> FileAttr {
        let (kind, perm, nlink) = if entry.is_directory {
            (FileType::Directory, DEFAULT_DIR_PERM, 2)
        } else if entry.attributes.contains(EntryAttributes::READONLY) {
            (FileType::RegularFile, READONLY_FILE_PERM, 1)
        } else {
            (FileType::RegularFile, DEFAULT_FILE_PERM, 1)
        };
        let perm = if self.read_only { perm & !0o222 } else { perm };
        FileAttr {
            ino,
            size: if entry.is_directory { 0 } else { entry.size },
            blocks: entry.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: entry.modified,
            mtime: entry.modified,
            ctime: entry.modified,
            crtime: entry.created,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn attr_for(&self, ino: u64, path: &RemotePath) -> FsResult<FileAttr> {
        let entry = self.fs.get_attributes(path)?;
        Ok(self.make_attr(ino, &entry))
    }

    fn lookup(&self, parent: u64, name: &str) -> FsResult<FileAttr> {
        let path = self.child_of(parent, name)?;
        let entry = self.fs.get_attributes(&path)?;
        let ino = self.inodes.get_or_insert(path);
        Ok(self.make_attr(ino, &entry))
    }

    fn readdir(&self, ino: u64, offset: i64, mut reply: ReplyDirectory) {
        let result = self.path_of(ino).and_then(|path| {
            let listing = self.fs.list(&path)?;
            Ok((path, listing))
        });
        let (path, listing) = match result {
            Ok(found) => found,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.get_inode(&parent))
            .unwrap_or(ROOT_INODE);
        let dots = [(ino, FileType::Directory, "."), (parent_ino, FileType::Directory, "..")];
        let children = listing.iter().map(|entry| {
            let child = path.join(&entry.name);
            let child_ino = self
                .inodes
                .get_inode(&child)
                .unwrap_or_else(|| self.inodes.get_or_insert(child));
            let kind = if entry.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            (child_ino, kind, entry.name.as_str())
        });

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in dots.into_iter().chain(children).enumerate().skip(skip) {
            let next = i64::try_from(i + 1).unwrap_or(i64::MAX);
            if reply.add(entry_ino, next, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// FUSE filesystem over one remote backend.
pub struct RdriveFs {
    inner: Arc<Inner>,
    workers: Option<WorkerPool>,
}

impl RdriveFs {
    pub fn new(fs: RemoteFs, workers: WorkerPool, attr_ttl: Duration, read_only: bool) -> Self {
        // SAFETY: getuid/getgid cannot fail and have no preconditions
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        info!(uid, gid, read_only, workers = workers.worker_count(), "rdrive filesystem initialized");
        Self {
            inner: Arc::new(Inner {
                fs,
                inodes: InodeTable::new(),
                attr_ttl,
                uid,
                gid,
                read_only,
            }),
            workers: Some(workers),
        }
    }

    /// Runs `op` on a worker thread. A rejected request replies `ETIMEDOUT`.
    fn dispatch<R, F>(&self, reply: R, op: F)
    where
        R: ErrorReply,
        F: FnOnce(&Inner, R) + Send + 'static,
    {
        let Some(workers) = &self.workers else {
            reply.error(libc::ESHUTDOWN);
            return;
        };
        let inner = Arc::clone(&self.inner);
        workers.submit(move |admission| match admission {
            Admission::Run => op(&inner, reply),
            Admission::Busy => reply.error(libc::ETIMEDOUT),
        });
    }

    fn writable<R: ErrorReply>(&self, reply: R) -> Option<R> {
        if self.inner.read_only {
            reply.error(libc::EROFS);
            None
        } else {
            Some(reply)
        }
    }
}

/// Converts a kernel name, replying `EINVAL` when it is not UTF-8.
fn utf8_name<R: ErrorReply>(name: &OsStr, reply: R) -> Option<(String, R)> {
    if let Some(name) = name.to_str() {
        Some((name.to_string(), reply))
    } else {
        reply.error(libc::EINVAL);
        None
    }
}

impl Filesystem for RdriveFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!("FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        let failed = self.inner.fs.shutdown();
        if failed > 0 {
            warn!(failed, "Some buffers could not be uploaded at unmount");
        }
        info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        trace!(parent, name = %name, "lookup");
        self.dispatch(reply, move |inner, reply| match inner.lookup(parent, &name) {
            Ok(attr) => reply.entry(&inner.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inner.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        self.dispatch(reply, move |inner, reply| {
            match inner.path_of(ino).and_then(|path| inner.attr_for(ino, &path)) {
                Ok(attr) => reply.attr(&inner.attr_ttl, &attr),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?size, ?fh, "setattr");
        let reply = if size.is_some() {
            match self.writable(reply) {
                Some(reply) => reply,
                None => return,
            }
        } else {
            reply
        };
        // Only size changes reach the backend; mode, owner and times are not stored remotely
        self.dispatch(reply, move |inner, reply| {
            let result = inner.path_of(ino).and_then(|path| {
                match (size, fh) {
                    (Some(size), Some(fh)) => inner.fs.set_size(fh, size)?,
                    (Some(size), None) => inner.fs.truncate(&path, size)?,
                    (None, _) => {}
                }
                inner.attr_for(ino, &path)
            });
            match result {
                Ok(attr) => reply.attr(&inner.attr_ttl, &attr),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let truncate = flags & libc::O_TRUNC != 0;
        trace!(inode = ino, write, truncate, "open");
        let reply = if write {
            match self.writable(reply) {
                Some(reply) => reply,
                None => return,
            }
        } else {
            reply
        };
        self.dispatch(reply, move |inner, reply| {
            match inner
                .path_of(ino)
                .and_then(|path| inner.fs.open(&path, write, truncate))
            {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.dispatch(reply, move |inner, reply| {
            match inner.fs.read(fh, offset, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let data = data.to_vec();
        self.dispatch(reply, move |inner, reply| match inner.fs.write(fh, offset, &data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        self.dispatch(reply, move |inner, reply| match inner.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        self.dispatch(reply, move |inner, reply| match inner.fs.close(fh) {
            Ok(()) | Err(FsError::InvalidHandle(_)) => reply.ok(),
            Err(e) => {
                // The kernel has forgotten this fh, so nobody can retry
                warn!(fh, error = %e, "Final flush failed on release");
                inner.fs.abandon(fh);
                reply.error(e.to_errno());
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "fsync");
        self.dispatch(reply, move |inner, reply| match inner.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        if self.inner.inodes.get(ino).is_some() {
            reply.opened(0, 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, reply: ReplyDirectory) {
        trace!(inode = ino, offset, "readdir");
        self.dispatch(reply, move |inner, reply| inner.readdir(ino, offset, reply));
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let volume = self.inner.fs.volume_info();
        let blocks = volume.capacity_bytes / u64::from(BLOCK_SIZE);
        let free = volume.free_bytes / u64::from(BLOCK_SIZE);
        reply.statfs(blocks, free, free, 1_000_000, 1_000_000, BLOCK_SIZE, MAX_NAME_LEN, BLOCK_SIZE);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        let Some(reply) = self.writable(reply) else {
            return;
        };
        trace!(parent, name = %name, "create");
        self.dispatch(reply, move |inner, reply| {
            let result = inner.child_of(parent, &name).and_then(|path| {
                let (fh, entry) = inner.fs.create(&path)?;
                let ino = inner.inodes.get_or_insert(path);
                Ok((fh, inner.make_attr(ino, &entry)))
            });
            match result {
                Ok((fh, attr)) => reply.created(&inner.attr_ttl, &attr, 0, fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        let Some(reply) = self.writable(reply) else {
            return;
        };
        trace!(parent, name = %name, "mkdir");
        self.dispatch(reply, move |inner, reply| {
            let result = inner.child_of(parent, &name).and_then(|path| {
                let entry = inner.fs.mkdir(&path)?;
                let ino = inner.inodes.get_or_insert(path);
                Ok(inner.make_attr(ino, &entry))
            });
            match result {
                Ok(attr) => reply.entry(&inner.attr_ttl, &attr, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        let Some(reply) = self.writable(reply) else {
            return;
        };
        trace!(parent, name = %name, "unlink");
        self.dispatch(reply, move |inner, reply| {
            let result = inner.child_of(parent, &name).and_then(|path| {
                inner.fs.delete(&path)?;
                inner.inodes.invalidate_path(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        let Some(reply) = self.writable(reply) else {
            return;
        };
        trace!(parent, name = %name, "rmdir");
        self.dispatch(reply, move |inner, reply| {
            let result = inner.child_of(parent, &name).and_then(|path| {
                inner.fs.rmdir(&path)?;
                inner.inodes.invalidate_path(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some((name, reply)) = utf8_name(name, reply) else {
            return;
        };
        let Some((newname, reply)) = utf8_name(newname, reply) else {
            return;
        };
        let Some(reply) = self.writable(reply) else {
            return;
        };
        if flags & RENAME_EXCHANGE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let replace = flags & RENAME_NOREPLACE == 0;
        trace!(parent, name = %name, newparent, newname = %newname, replace, "rename");

        self.dispatch(reply, move |inner, reply| {
            let result = inner.child_of(parent, &name).and_then(|from| {
                let to = inner.child_of(newparent, &newname)?;
                inner.fs.rename(&from, &to, replace)?;
                inner.inodes.rename(&from, &to);
                debug!(from = %from, to = %to, "Inodes follow rename");
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}
