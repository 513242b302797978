//! Open-handle state for the bridge.
//!
//! Every open file gets an [`OpenHandle`] stored behind its own mutex in the
//! bridge's [`HandleTable`](rdrive_mount::HandleTable). The handle tracks
//! where it is in its lifecycle:
//!
//! ```text
//!   open(existing) ─► Open ──write──► BufferingMemory ──past threshold──► BufferingSpooled
//!   create/truncate ─► OpenedNew ─┘          │                                  │
//!                                            └──────────── flush ───────────────┤
//!                                                                               ▼
//!                                        Dirty ◄── upload failed ──────── (uploading)
//!                                                                               │
//!                                                         Flushed ◄── upload ok ┘
//!                                                            │
//!                                                        close ──► Closed
//! ```
//!
//! A `Dirty` handle still owns its buffer, so a retried flush or close
//! uploads the same bytes again.
//!
//! The handle does not know its path. The bridge keeps that outside the
//! mutex so a rename can move it while the handle is mid-transfer.

use rdrive_mount::{BufferMode, WriteBuffer};

/// How a handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Existing object; the first write downloads it.
    Write,
    /// Freshly created or truncated; starts with an empty, dirty buffer.
    New,
}

/// Lifecycle phase of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    /// Open with nothing written yet.
    Open,
    OpenedNew,
    BufferingMemory,
    BufferingSpooled,
    /// An upload failed; the buffer is retained for a retry.
    Dirty,
    /// Content uploaded; the handle is still open.
    Flushed,
    Closed,
}

impl HandlePhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::OpenedNew => "OpenedNew",
            Self::BufferingMemory => "BufferingMemory",
            Self::BufferingSpooled => "BufferingSpooled",
            Self::Dirty => "Dirty",
            Self::Flushed => "Flushed",
            Self::Closed => "Closed",
        }
    }
}

/// One open file.
#[derive(Debug)]
pub struct OpenHandle {
    mode: OpenMode,
    phase: HandlePhase,
    /// Whether the backend serves ranged reads for this object.
    ranged: bool,
    /// Size of the remote object when the handle was opened.
    remote_size: u64,
    /// Local copy of the content: the write buffer, or for backends without
    /// ranged reads the whole object fetched on first read.
    content: Option<WriteBuffer>,
}

impl OpenHandle {
    /// Handle on an existing object. Nothing is downloaded yet.
    pub fn existing(mode: OpenMode, remote_size: u64, ranged: bool) -> Self {
        Self {
            mode,
            phase: HandlePhase::Open,
            ranged,
            remote_size,
            content: None,
        }
    }

    /// Handle on a created or truncated object, owning `buffer`.
    pub fn new_object(buffer: WriteBuffer, ranged: bool) -> Self {
        Self {
            mode: OpenMode::New,
            phase: HandlePhase::OpenedNew,
            ranged,
            remote_size: 0,
            content: Some(buffer),
        }
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn phase(&self) -> HandlePhase {
        self.phase
    }

    pub fn is_writable(&self) -> bool {
        self.mode != OpenMode::Read
    }

    pub fn is_closed(&self) -> bool {
        self.phase == HandlePhase::Closed
    }

    pub fn ranged(&self) -> bool {
        self.ranged
    }

    /// Current logical size, buffered bytes included.
    pub fn size(&self) -> u64 {
        self.content.as_ref().map_or(self.remote_size, WriteBuffer::len)
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.content.as_ref().is_some_and(WriteBuffer::is_dirty)
    }

    pub fn content_mut(&mut self) -> Option<&mut WriteBuffer> {
        self.content.as_mut()
    }

    /// Installs the downloaded copy of the object.
    pub fn install(&mut self, buffer: WriteBuffer) {
        self.content = Some(buffer);
    }

    /// Records a local modification and moves to the matching buffering phase.
    pub fn note_write(&mut self) {
        if let Some(buffer) = &self.content {
            self.phase = match buffer.mode() {
                BufferMode::Memory => HandlePhase::BufferingMemory,
                BufferMode::Spooled => HandlePhase::BufferingSpooled,
            };
        }
    }

    pub fn mark_flushed(&mut self) {
        if let Some(buffer) = &mut self.content {
            buffer.mark_clean();
        }
        self.phase = HandlePhase::Flushed;
    }

    pub fn mark_upload_failed(&mut self) {
        if let Some(buffer) = &mut self.content {
            buffer.mark_dirty();
        }
        self.phase = HandlePhase::Dirty;
    }

    /// Releases the buffer. Returns how many unsaved bytes were dropped.
    pub fn close(&mut self) -> u64 {
        let discarded = if self.is_dirty() { self.size() } else { 0 };
        self.content = None;
        self.phase = HandlePhase::Closed;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_handle_is_unloaded() {
        let handle = OpenHandle::existing(OpenMode::Read, 42, true);
        assert_eq!(handle.phase(), HandlePhase::Open);
        assert_eq!(handle.size(), 42);
        assert!(!handle.is_loaded());
        assert!(!handle.is_dirty());
        assert!(!handle.is_writable());
    }

    #[test]
    fn test_new_object_is_dirty_even_when_empty() {
        let handle = OpenHandle::new_object(WriteBuffer::new_for_create(8), false);
        assert_eq!(handle.phase(), HandlePhase::OpenedNew);
        assert!(handle.is_dirty());
        assert_eq!(handle.size(), 0);
    }

    #[test]
    fn test_phase_follows_buffer_mode() {
        let mut handle = OpenHandle::new_object(WriteBuffer::new_for_create(4), true);
        handle.content_mut().unwrap().write(0, b"ab").unwrap();
        handle.note_write();
        assert_eq!(handle.phase(), HandlePhase::BufferingMemory);

        handle.content_mut().unwrap().write(2, b"cdef").unwrap();
        handle.note_write();
        assert_eq!(handle.phase(), HandlePhase::BufferingSpooled);
        assert_eq!(handle.size(), 6);
    }

    #[test]
    fn test_failed_upload_keeps_buffer() {
        let mut handle = OpenHandle::new_object(WriteBuffer::new_for_create(64), true);
        handle.content_mut().unwrap().write(0, b"keep").unwrap();
        handle.mark_upload_failed();
        assert_eq!(handle.phase(), HandlePhase::Dirty);
        assert!(handle.is_dirty());
        assert_eq!(handle.content_mut().unwrap().read(0, 4).unwrap(), b"keep");

        handle.mark_flushed();
        assert_eq!(handle.phase(), HandlePhase::Flushed);
        assert!(!handle.is_dirty());
    }

    #[test]
    fn test_close_reports_discarded_bytes() {
        let mut handle = OpenHandle::new_object(WriteBuffer::new_for_create(64), true);
        handle.content_mut().unwrap().write(0, b"lost").unwrap();
        assert_eq!(handle.close(), 4);
        assert!(handle.is_closed());
        assert!(!handle.is_loaded());
    }
}
