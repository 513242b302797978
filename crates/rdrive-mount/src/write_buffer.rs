//! Write buffer for random-access writes to whole-object remote files.
//!
//! None of the supported backends can patch bytes in place: an update is
//! always a full-object replace. The [`WriteBuffer`] implements the
//! read-modify-write pattern this forces:
//!
//! 1. On first write to an existing object: the whole object is downloaded
//!    into the buffer (see [`WriteBuffer::appender`])
//! 2. On write: data is copied into the buffer at the given offset
//! 3. On flush/close: if dirty, the whole buffer is uploaded via
//!    [`WriteBuffer::upload_source`]
//!
//! Content lives in memory until it grows past a threshold, then moves to an
//! anonymous temp file. The migration is invisible to readers: bytes read
//! back are identical in both modes.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

/// Default size past which buffered content is spooled to disk (8 MiB).
pub const DEFAULT_SPOOL_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Where the buffered bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Memory,
    Spooled,
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<u8>),
    Spooled(File),
}

/// A buffer for random-access writes to a remote file.
///
/// # Example
///
/// ```
/// use rdrive_mount::{BufferMode, WriteBuffer};
///
/// // Tiny threshold to show the spill
/// let mut buf = WriteBuffer::new_for_create(4);
/// buf.write(0, b"Hi").unwrap();
/// assert_eq!(buf.mode(), BufferMode::Memory);
///
/// buf.write(2, b", World!").unwrap();
/// assert_eq!(buf.mode(), BufferMode::Spooled);
/// assert_eq!(buf.read(0, 10).unwrap(), b"Hi, World!");
/// assert!(buf.is_dirty());
/// ```
#[derive(Debug)]
pub struct WriteBuffer {
    storage: Storage,
    /// Logical length. For spooled storage the file length always matches.
    len: u64,
    dirty: bool,
    threshold: u64,
    spool_dir: Option<PathBuf>,
}

impl WriteBuffer {
    /// Create a clean, empty buffer.
    ///
    /// Used for handles opened on an existing object before anything has
    /// been downloaded.
    pub fn new(threshold: u64) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            len: 0,
            dirty: false,
            threshold,
            spool_dir: None,
        }
    }

    /// Create a buffer for a newly created (or truncated) object.
    ///
    /// Unlike [`new`](Self::new), this marks the buffer dirty so the object
    /// is uploaded even if nothing is ever written.
    pub fn new_for_create(threshold: u64) -> Self {
        Self {
            dirty: true,
            ..Self::new(threshold)
        }
    }

    /// Create a clean buffer holding `content`, spooling at once if it is
    /// already past the threshold.
    pub fn from_content(content: Vec<u8>, threshold: u64) -> io::Result<Self> {
        let mut buf = Self::new(threshold);
        buf.len = content.len() as u64;
        buf.storage = Storage::Memory(content);
        if buf.len > threshold {
            buf.spill()?;
        }
        Ok(buf)
    }

    /// Spool into `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    fn spool_file(&self) -> io::Result<File> {
        match &self.spool_dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
    }

    /// Move in-memory content to a temp file. No-op when already spooled.
    fn spill(&mut self) -> io::Result<()> {
        let Storage::Memory(content) = &self.storage else {
            return Ok(());
        };
        let mut file = self.spool_file()?;
        file.write_all(content)?;
        debug!(bytes = content.len(), threshold = self.threshold, "Spooled write buffer to disk");
        self.storage = Storage::Spooled(file);
        Ok(())
    }

    /// Write data at the specified offset.
    ///
    /// The buffer is expanded if the write extends past the current end; gaps
    /// are zero-filled. A zero-length write changes nothing.
    ///
    /// # Returns
    ///
    /// The number of bytes written (always equals `data.len()`).
    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > self.threshold {
            self.spill()?;
        }

        match &mut self.storage {
            Storage::Memory(content) => {
                // Memory storage never exceeds the threshold, so these fit in usize
                #[allow(clippy::cast_possible_truncation)]
                let (start, end) = (offset as usize, end as usize);
                if end > content.len() {
                    // 1.5x geometric growth keeps sequential appends O(n)
                    let new_capacity = std::cmp::max(end, (content.capacity() * 3) / 2);
                    if new_capacity > content.capacity() {
                        content.reserve(new_capacity - content.len());
                    }
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(data);
            }
            Storage::Spooled(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
            }
        }

        self.len = self.len.max(end);
        self.dirty = true;
        Ok(data.len())
    }

    /// Read up to `size` bytes at `offset`. Returns an empty vector past end.
    pub fn read(&mut self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        if offset >= self.len {
            return Ok(Vec::new());
        }
        let available = self.len - offset;
        let take = usize::try_from(available).map_or(size, |avail| avail.min(size));

        match &mut self.storage {
            Storage::Memory(content) => {
                #[allow(clippy::cast_possible_truncation)]
                let start = offset as usize;
                Ok(content[start..start + take].to_vec())
            }
            Storage::Spooled(file) => {
                let mut out = vec![0u8; take];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Truncate or extend (with zeros) to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> io::Result<()> {
        if size == self.len {
            return Ok(());
        }
        if size > self.threshold {
            self.spill()?;
        }
        match &mut self.storage {
            Storage::Memory(content) => {
                #[allow(clippy::cast_possible_truncation)]
                content.resize(size as usize, 0);
            }
            Storage::Spooled(file) => file.set_len(size)?,
        }
        self.len = size;
        self.dirty = true;
        Ok(())
    }

    /// Append bytes at the end without marking the buffer dirty.
    ///
    /// Used while downloading the existing object; the downloaded state is
    /// the clean baseline.
    fn append_clean(&mut self, data: &[u8]) -> io::Result<()> {
        let was_dirty = self.dirty;
        self.write(self.len, data)?;
        self.dirty = was_dirty;
        Ok(())
    }

    /// A [`Write`] adapter that appends to the buffer, for streaming a
    /// download into it.
    pub fn appender(&mut self) -> Appender<'_> {
        Appender { buffer: self }
    }

    /// A rewindable reader over the complete content, for whole-object
    /// uploads.
    pub fn upload_source(&mut self) -> io::Result<UploadReader<'_>> {
        match &mut self.storage {
            Storage::Memory(content) => Ok(UploadReader::Memory(Cursor::new(content.as_slice()))),
            Storage::Spooled(file) => {
                file.seek(SeekFrom::Start(0))?;
                Ok(UploadReader::Spooled(file))
            }
        }
    }

    /// Drop all content, keeping the current mode.
    pub fn clear(&mut self) -> io::Result<()> {
        match &mut self.storage {
            Storage::Memory(content) => content.clear(),
            Storage::Spooled(file) => file.set_len(0)?,
        }
        self.len = 0;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn mode(&self) -> BufferMode {
        match self.storage {
            Storage::Memory(_) => BufferMode::Memory,
            Storage::Spooled(_) => BufferMode::Spooled,
        }
    }

    #[inline]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Mark the buffer as clean (after a successful upload).
    #[inline]
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Mark the buffer as dirty (for re-marking after a failed upload).
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Streams a download into a [`WriteBuffer`] without dirtying it.
pub struct Appender<'a> {
    buffer: &'a mut WriteBuffer,
}

impl Write for Appender<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.append_clean(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Borrowed reader over a buffer's content.
pub enum UploadReader<'a> {
    Memory(Cursor<&'a [u8]>),
    Spooled(&'a mut File),
}

impl Read for UploadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::Spooled(file) => file.read(buf),
        }
    }
}

impl Seek for UploadReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Memory(cursor) => cursor.seek(pos),
            Self::Spooled(file) => file.seek(pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: u64 = 16;

    fn content_of(buf: &mut WriteBuffer) -> Vec<u8> {
        let len = usize::try_from(buf.len()).unwrap();
        buf.read(0, len).unwrap()
    }

    #[test]
    fn test_write_buffer_new() {
        let mut buf = WriteBuffer::from_content(vec![1, 2, 3], SMALL).unwrap();
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_dirty());
        assert_eq!(buf.mode(), BufferMode::Memory);
        assert_eq!(content_of(&mut buf), vec![1, 2, 3]);
    }

    #[test]
    fn test_write_buffer_new_empty() {
        let buf = WriteBuffer::new(SMALL);
        assert!(buf.is_empty());
        assert!(!buf.is_dirty());
    }

    #[test]
    fn test_write_buffer_new_for_create() {
        // Dirty even when empty so close creates the object
        let buf = WriteBuffer::new_for_create(SMALL);
        assert!(buf.is_empty());
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_write_buffer_write_extends_buffer() {
        let mut buf = WriteBuffer::from_content(vec![1, 2, 3], SMALL).unwrap();
        assert_eq!(buf.write(5, b"xyz").unwrap(), 3);
        assert_eq!(buf.len(), 8);
        assert_eq!(content_of(&mut buf), vec![1, 2, 3, 0, 0, b'x', b'y', b'z']);
    }

    #[test]
    fn test_write_buffer_read_clamps() {
        let mut buf = WriteBuffer::from_content(b"hello world".to_vec(), SMALL).unwrap();
        assert_eq!(buf.read(0, 5).unwrap(), b"hello");
        assert_eq!(buf.read(6, 100).unwrap(), b"world");
        assert_eq!(buf.read(11, 1).unwrap(), b"");
        assert_eq!(buf.read(100, 10).unwrap(), b"");
    }

    #[test]
    fn test_write_buffer_overwrite() {
        let mut buf = WriteBuffer::from_content(b"hello world".to_vec(), 64).unwrap();
        buf.write(6, b"rust!").unwrap();
        assert_eq!(content_of(&mut buf), b"hello rust!");
    }

    #[test]
    fn test_zero_length_write_is_noop() {
        let mut buf = WriteBuffer::from_content(vec![1, 2, 3], SMALL).unwrap();
        assert_eq!(buf.write(10, &[]).unwrap(), 0);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn test_spill_on_threshold_plus_one() {
        let mut buf = WriteBuffer::new_for_create(SMALL);
        let data: Vec<u8> = (0..=16).collect();
        buf.write(0, &data[..16]).unwrap();
        assert_eq!(buf.mode(), BufferMode::Memory, "exactly threshold stays in memory");

        buf.write(16, &data[16..]).unwrap();
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert_eq!(content_of(&mut buf), data);
    }

    #[test]
    fn test_spooled_writes_and_sparse_gap() {
        let mut buf = WriteBuffer::new_for_create(4);
        buf.write(10, b"end").unwrap();
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert_eq!(buf.len(), 13);
        let content = content_of(&mut buf);
        assert!(content[..10].iter().all(|&b| b == 0));
        assert_eq!(&content[10..], b"end");

        buf.write(0, b"ab").unwrap();
        assert_eq!(&content_of(&mut buf)[..3], &[b'a', b'b', 0]);
    }

    #[test]
    fn test_truncate_in_both_modes() {
        let mut buf = WriteBuffer::from_content(b"hello world".to_vec(), 64).unwrap();
        buf.truncate(5).unwrap();
        assert_eq!(content_of(&mut buf), b"hello");
        assert!(buf.is_dirty());

        buf.truncate(100).unwrap();
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert_eq!(buf.len(), 100);
        let content = content_of(&mut buf);
        assert_eq!(&content[..5], b"hello");
        assert!(content[5..].iter().all(|&b| b == 0));

        buf.truncate(2).unwrap();
        assert_eq!(content_of(&mut buf), b"he");
    }

    #[test]
    fn test_truncate_same_size_stays_clean() {
        let mut buf = WriteBuffer::from_content(b"hi".to_vec(), SMALL).unwrap();
        buf.truncate(2).unwrap();
        assert!(!buf.is_dirty());
    }

    #[test]
    fn test_appender_downloads_clean() {
        let mut buf = WriteBuffer::new(8);
        buf.appender().write_all(b"downloaded content").unwrap();
        assert_eq!(buf.len(), 18);
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert!(!buf.is_dirty(), "download establishes the clean baseline");
        assert_eq!(content_of(&mut buf), b"downloaded content");
    }

    #[test]
    fn test_upload_source_rewinds() {
        for threshold in [4, 64] {
            let mut buf = WriteBuffer::new_for_create(threshold);
            buf.write(0, b"payload bytes").unwrap();
            let mut reader = buf.upload_source().unwrap();
            let mut first = Vec::new();
            reader.read_to_end(&mut first).unwrap();
            reader.rewind().unwrap();
            let mut second = Vec::new();
            reader.read_to_end(&mut second).unwrap();
            assert_eq!(first, b"payload bytes");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_mark_clean_and_dirty() {
        let mut buf = WriteBuffer::new(SMALL);
        buf.write(0, b"data").unwrap();
        assert!(buf.is_dirty());
        buf.mark_clean();
        assert!(!buf.is_dirty());
        buf.mark_dirty();
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_clear_keeps_mode() {
        let mut buf = WriteBuffer::new_for_create(4);
        buf.write(0, b"spilled!").unwrap();
        buf.clear().unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert_eq!(buf.read(0, 10).unwrap(), b"");
    }

    #[test]
    fn test_spool_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = WriteBuffer::new_for_create(2).with_spool_dir(dir.path());
        buf.write(0, b"abc").unwrap();
        assert_eq!(buf.mode(), BufferMode::Spooled);
        assert_eq!(content_of(&mut buf), b"abc");
    }
}
