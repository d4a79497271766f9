//! A single fixed-capacity data segment file
//!
//! Data segments hold raw payload bytes, byte-packed with no per-record
//! framing; the index layer knows where each payload starts and ends.
//! Payloads may straddle segment boundaries, so a segment write is allowed
//! to be partial and the caller continues in the next segment.
//!
//! The whole file is memory-mapped read-write. The first 24 bytes are the
//! header (segment id, payload capacity, write cursor); the rest is the
//! payload area. Bytes below the cursor are immutable until the segment is
//! unlinked.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, SegLogError};
use crate::storage::layout::{data_segment_offsets, data_segment_path, DATA_SEGMENT_HEADER_SIZE};
use crate::storage::mmap::SharedMmap;

/// One memory-mapped data segment
///
/// Writes are serialized by an internal mutex; reads are lock-free against
/// the writer for already-committed bytes (the acquire load of the cursor
/// establishes the visible prefix).
#[derive(Debug)]
pub(crate) struct DataSegment {
    path: PathBuf,
    _file: File,
    segment_id: i64,
    size: i64,
    cursor: AtomicI64,
    map: SharedMmap,
    write_mu: Mutex<()>,
}

impl DataSegment {
    /// Create or open the data segment with the given id
    ///
    /// A missing file is created exclusively, truncated to its full final
    /// length and stamped with a fresh header. An existing file is opened
    /// and its header loaded; the header values are authoritative.
    pub fn open(work_dir: &Path, id: i64, size: i64) -> Result<Self> {
        let path = data_segment_path(work_dir, id);
        let (file, is_new) = open_segment_file(&path, size + DATA_SEGMENT_HEADER_SIZE)?;
        let map = SharedMmap::map(&file)?;

        // The file name is only a locator; for existing files the header is
        // authoritative, so a size change in the configuration never affects
        // segments already on disk.
        let (segment_id, size, cursor) = if is_new {
            (id, size, 0)
        } else {
            (
                map.get_i64(data_segment_offsets::SEGMENT_ID),
                map.get_i64(data_segment_offsets::SIZE),
                map.get_i64(data_segment_offsets::CURSOR),
            )
        };

        let segment = Self {
            path,
            _file: file,
            segment_id,
            size,
            cursor: AtomicI64::new(cursor),
            map,
            write_mu: Mutex::new(()),
        };

        if is_new {
            segment.flush_header();
        }
        trace!(segment_id = segment.segment_id, is_new, "opened data segment");

        Ok(segment)
    }

    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn flush_header(&self) {
        self.map
            .put_i64(data_segment_offsets::SEGMENT_ID, self.segment_id);
        self.map.put_i64(data_segment_offsets::SIZE, self.size);
        self.map
            .put_i64(data_segment_offsets::CURSOR, self.cursor());
    }

    /// Append as many of `data`'s bytes as fit
    ///
    /// Returns the pre-advance offset and the number of bytes copied, which
    /// is `min(data.len(), available)`. Partial writes are the norm for
    /// payloads exceeding the remaining capacity; the manager continues in
    /// the next segment.
    pub fn write(&self, data: &[u8]) -> (i64, i64) {
        let _guard = self.write_mu.lock();

        let offset = self.cursor.load(Ordering::Relaxed);
        let n = data.len().min((self.size - offset) as usize);
        self.map.write_at(
            (DATA_SEGMENT_HEADER_SIZE + offset) as usize,
            &data[..n],
        );
        // Publish the bytes before the new cursor becomes visible.
        self.cursor.store(offset + n as i64, Ordering::Release);
        (offset, n as i64)
    }

    /// Copy committed bytes at `offset` into `buf`
    ///
    /// Returns the number of bytes copied: zero when `offset` is at or past
    /// the cursor, `min(buf.len(), cursor - offset)` otherwise.
    pub fn read(&self, buf: &mut [u8], offset: i64) -> i64 {
        let cursor = self.cursor();
        if offset >= cursor {
            return 0;
        }
        let n = buf.len().min((cursor - offset) as usize);
        self.map.read_into(
            (DATA_SEGMENT_HEADER_SIZE + offset) as usize,
            &mut buf[..n],
        );
        n as i64
    }

    /// Borrow a payload byte range, clamped to the segment capacity
    ///
    /// Returns the view `[offset, offset + effective)` with
    /// `effective = min(size, capacity - offset)`. Used for stitched
    /// multi-segment reads.
    pub fn payload_view(&self, offset: i64, size: i64) -> (&[u8], i64) {
        let effective = size.min(self.size - offset);
        let view = self.map.slice(
            (DATA_SEGMENT_HEADER_SIZE + offset) as usize,
            effective as usize,
        );
        (view, effective)
    }

    /// Remaining payload capacity in bytes
    pub fn available_size(&self) -> i64 {
        self.size - self.cursor()
    }

    pub fn available(&self) -> bool {
        self.available_size() > 0
    }

    /// Flush the header and msync the mapping
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_mu.lock();
        self.flush_header();
        self.map.sync()?;
        Ok(())
    }

    /// Close the segment and remove its file
    pub fn unlink(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Open or create a segment file of exactly `len` bytes
///
/// New files are created with exclusive semantics so two instances can never
/// initialize the same segment. `O_SYNC` is requested so write-backs reach
/// the device before returning.
pub(crate) fn open_segment_file(path: &Path, len: i64) -> Result<(File, bool)> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_SYNC);
    }

    if path.exists() {
        if path.is_dir() {
            return Err(SegLogError::config(format!(
                "{}: is a directory",
                path.display()
            )));
        }
        let file = options.open(path)?;
        Ok((file, false))
    } else {
        let file = options.create_new(true).open(path)?;
        file.set_len(len as u64)?;
        Ok((file, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let seg = DataSegment::open(dir.path(), 0, 128).unwrap();
        assert!(seg.available());
        assert_eq!(seg.available_size(), 128);

        let (offset, written) = seg.write(b"Hello, World!");
        assert_eq!(offset, 0);
        assert_eq!(written, 13);
        assert_eq!(seg.cursor(), 13);

        let mut buf = [0u8; 13];
        assert_eq!(seg.read(&mut buf, 0), 13);
        assert_eq!(&buf, b"Hello, World!");
    }

    #[test]
    fn test_partial_write_at_capacity() {
        let dir = tempdir().unwrap();
        let seg = DataSegment::open(dir.path(), 0, 8).unwrap();

        let (offset, written) = seg.write(b"0123456789");
        assert_eq!(offset, 0);
        assert_eq!(written, 8);
        assert!(!seg.available());

        // A full segment accepts nothing more.
        let (offset, written) = seg.write(b"x");
        assert_eq!(offset, 8);
        assert_eq!(written, 0);
    }

    #[test]
    fn test_read_past_cursor_yields_nothing() {
        let dir = tempdir().unwrap();
        let seg = DataSegment::open(dir.path(), 0, 64).unwrap();
        seg.write(b"abc");

        let mut buf = [0u8; 8];
        assert_eq!(seg.read(&mut buf, 3), 0);
        assert_eq!(seg.read(&mut buf, 100), 0);
        // A read straddling the cursor is clamped to committed bytes.
        assert_eq!(seg.read(&mut buf, 1), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn test_payload_view_clamps_to_capacity() {
        let dir = tempdir().unwrap();
        let seg = DataSegment::open(dir.path(), 0, 16).unwrap();
        seg.write(b"0123456789abcdef");

        let (view, effective) = seg.payload_view(10, 100);
        assert_eq!(effective, 6);
        assert_eq!(view, b"abcdef");

        let (view, effective) = seg.payload_view(0, 4);
        assert_eq!(effective, 4);
        assert_eq!(view, b"0123");
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let seg = DataSegment::open(dir.path(), 3, 64).unwrap();
            seg.write(b"persist me");
            seg.close().unwrap();
        }

        let seg = DataSegment::open(dir.path(), 3, 64).unwrap();
        assert_eq!(seg.segment_id(), 3);
        assert_eq!(seg.cursor(), 10);

        let mut buf = [0u8; 10];
        assert_eq!(seg.read(&mut buf, 0), 10);
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn test_unlink_removes_file() {
        let dir = tempdir().unwrap();
        let seg = DataSegment::open(dir.path(), 0, 32).unwrap();
        let path = dir.path().join("data0000");
        assert!(path.exists());
        seg.unlink().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_file_is_truncated_to_capacity_plus_header() {
        let dir = tempdir().unwrap();
        let _seg = DataSegment::open(dir.path(), 0, 100).unwrap();
        let meta = std::fs::metadata(dir.path().join("data0000")).unwrap();
        assert_eq!(meta.len(), 124);
    }
}
