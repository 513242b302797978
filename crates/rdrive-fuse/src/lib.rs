//! FUSE filesystem for FTP, SFTP and Google Drive storage.
//!
//! This crate mounts one remote backend as a local filesystem.
//!
//! - [`RemoteFs`] is the host-neutral bridge: cached metadata, per-handle
//!   write buffers, per-path locking and error translation.
//! - [`RdriveFs`] adapts it to fuser, running requests on a bounded
//!   [`WorkerPool`].
//! - [`mount()`] wires a [`MountConfig`] into a background session.
//!
//! # Usage
//!
//! ```ignore
//! use rdrive_fuse::{MountConfig, BackendTarget, Secrets, build_backend, mount};
//!
//! let config = MountConfig::new(BackendTarget::parse("sftp://alice@files.example.org")?);
//! let backend = build_backend(&config, &Secrets::from_env())?;
//! let handle = mount(&config, backend, mountpoint)?;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod mount;
pub mod workers;

pub use bridge::{RemoteFs, VolumeInfo};
pub use config::{BackendTarget, MountConfig};
pub use error::{FsError, FsResult};
pub use filesystem::RdriveFs;
pub use handles::{HandlePhase, OpenHandle, OpenMode};
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
pub use mount::{Backend, MountHandle, Secrets, SetupError, build_backend, build_remote_fs, mount};
pub use workers::{Admission, WorkerPool};
