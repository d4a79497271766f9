//! Ownership and rotation of the data segment set
//!
//! The manager owns every data segment in the work directory, keeps the
//! highest-id one writable ("current"), splits payload writes across segment
//! boundaries, stitches multi-segment reads back together, and unlinks
//! segments the index no longer references.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Result, SegLogError};
use crate::storage::data_segment::DataSegment;
use crate::storage::layout::{parse_segment_id, IndexRecord, DATA_SEGMENT_PREFIX};

/// Manager of the ordered data segment set
///
/// All writes (including rotation and vacuum) are serialized by an internal
/// mutex; reads only take the segment-map read lock long enough to clone the
/// `Arc`s they need.
#[derive(Debug)]
pub(crate) struct DataManager {
    work_dir: PathBuf,
    segment_size: i64,
    segments: RwLock<BTreeMap<i64, Arc<DataSegment>>>,
    current: RwLock<Option<Arc<DataSegment>>>,
    min_segment: AtomicI64,
    max_segment: AtomicI64,
    write_mu: Mutex<()>,
}

impl DataManager {
    /// Scan the work directory and open every data segment
    ///
    /// The highest-id segment becomes the current one; an empty directory
    /// rotates immediately so segment 0 always exists.
    pub fn open(work_dir: &Path, segment_size: i64) -> Result<Self> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(work_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = parse_segment_id(&name.to_string_lossy(), DATA_SEGMENT_PREFIX)? {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        info!(segments = ids.len(), "loading data segments");

        let manager = Self {
            work_dir: work_dir.to_path_buf(),
            segment_size,
            segments: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
            min_segment: AtomicI64::new(-1),
            max_segment: AtomicI64::new(-1),
            write_mu: Mutex::new(()),
        };

        for &id in &ids {
            let segment = Arc::new(DataSegment::open(work_dir, id, segment_size)?);
            manager.segments.write().insert(id, segment.clone());
            *manager.current.write() = Some(segment);
        }
        if let (Some(&min), Some(&max)) = (ids.first(), ids.last()) {
            manager.min_segment.store(min, Ordering::Release);
            manager.max_segment.store(max, Ordering::Release);
        }

        if ids.is_empty() {
            let _guard = manager.write_mu.lock();
            manager.rotate_locked()?;
        }

        Ok(manager)
    }

    /// Create a fresh segment and make it current
    ///
    /// Caller must hold the write mutex. The new id is `current + 1`, or 0
    /// when no segment exists.
    fn rotate_locked(&self) -> Result<Arc<DataSegment>> {
        let next_id = match self.current.read().as_ref() {
            Some(current) => current.segment_id() + 1,
            None => 0,
        };
        let segment = Arc::new(DataSegment::open(
            &self.work_dir,
            next_id,
            self.segment_size,
        )?);
        self.segments.write().insert(next_id, segment.clone());
        *self.current.write() = Some(segment.clone());
        self.max_segment.store(next_id, Ordering::Release);
        if next_id == 0 {
            self.min_segment.store(0, Ordering::Release);
        }
        debug!(segment_id = next_id, "rotated data segment");
        Ok(segment)
    }

    // The current pointer is only None transiently inside vacuum, which
    // holds the write mutex; every caller holds it too.
    #[allow(clippy::expect_used)]
    fn current_segment(&self) -> Arc<DataSegment> {
        self.current
            .read()
            .as_ref()
            .expect("data manager always keeps a current segment")
            .clone()
    }

    /// Write a payload, splitting across segments as needed
    ///
    /// Populates the record's start/end segment ids and the byte offset of
    /// the first chunk. On failure the record's location fields are not
    /// meaningful and no index state has been touched.
    pub fn write(&self, data: &[u8], rec: &mut IndexRecord) -> Result<()> {
        let _guard = self.write_mu.lock();

        #[cfg(feature = "metrics")]
        metrics::counter!("seglog_data_writes_total").increment(1);

        let mut current = self.current_segment();
        if !current.available() {
            current = self.rotate_locked()?;
        }

        rec.data_segment_start_id = current.segment_id();

        let total = data.len();
        let mut written = 0usize;
        while written < total {
            if !current.available() {
                current = self.rotate_locked()?;
            }
            let (offset, n) = current.write(&data[written..]);
            if written == 0 {
                rec.data_segment_offset = offset;
            }
            written += n as usize;
        }

        rec.data_segment_end_id = current.segment_id();
        Ok(())
    }

    /// Build a stitched sequential reader over a record's payload
    ///
    /// Starting at the record's first segment and offset, each successive
    /// segment contributes a view (offset 0 after the first) until the full
    /// size is covered. Fails with `SegmentMissing` when a referenced
    /// segment is absent.
    pub fn read(&self, rec: &IndexRecord) -> Result<RecordReader> {
        #[cfg(feature = "metrics")]
        metrics::counter!("seglog_data_reads_total").increment(1);

        let segments = self.segments.read();

        let mut parts = Vec::new();
        let mut remaining = rec.size;
        let mut segment_id = rec.data_segment_start_id;
        let mut offset = rec.data_segment_offset;

        while remaining > 0 {
            let segment = segments
                .get(&segment_id)
                .ok_or(SegLogError::SegmentMissing(segment_id))?;
            let effective = remaining.min(segment.size() - offset);
            parts.push(ReaderPart {
                segment: segment.clone(),
                offset,
                len: effective,
            });
            remaining -= effective;
            offset = 0;
            segment_id += 1;
        }

        Ok(RecordReader::new(parts))
    }

    /// Unlink every segment whose id is not in `in_use`
    ///
    /// When the set empties completely the manager rotates back to segment
    /// 0; when the current segment was among the unlinked ones the pointer
    /// is re-aimed at the new highest id.
    pub fn vacuum(&self, in_use: &HashSet<i64>) -> Result<()> {
        let _guard = self.write_mu.lock();

        info!(in_use = in_use.len(), "vacuuming data segments");
        #[cfg(feature = "metrics")]
        metrics::counter!("seglog_data_vacuums_total").increment(1);

        let victims: Vec<i64> = self
            .segments
            .read()
            .keys()
            .filter(|id| !in_use.contains(id))
            .copied()
            .collect();

        for id in victims {
            let Some(segment) = self.segments.write().remove(&id) else {
                continue;
            };
            debug!(segment_id = id, "unlinking data segment");
            segment.unlink()?;
            let mut current = self.current.write();
            if current
                .as_ref()
                .is_some_and(|c| c.segment_id() == id)
            {
                *current = None;
            }
        }

        if self.segments.read().is_empty() {
            debug!("all data segments cleared during vacuum, recreating initial segment");
            self.rotate_locked()?;
            return Ok(());
        }

        let (min, max) = {
            let segments = self.segments.read();
            (
                segments.keys().next().copied().unwrap_or(0),
                segments.keys().next_back().copied().unwrap_or(0),
            )
        };
        self.min_segment.store(min, Ordering::Release);
        self.max_segment.store(max, Ordering::Release);

        let mut current = self.current.write();
        if current.is_none() {
            *current = self.segments.read().get(&max).cloned();
        }

        Ok(())
    }

    /// Segment ids currently present, ascending
    #[cfg(test)]
    pub fn segment_ids(&self) -> Vec<i64> {
        self.segments.read().keys().copied().collect()
    }

    /// Flush and sync every segment, returning the first error encountered
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for (id, segment) in self.segments.read().iter() {
            if let Err(e) = segment.close() {
                debug!(segment_id = id, error = %e, "failed closing data segment");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct ReaderPart {
    segment: Arc<DataSegment>,
    offset: i64,
    len: i64,
}

/// Sequential reader over a record's payload bytes
///
/// Holds a reference to every data segment it spans, so the mapped bytes
/// stay valid even if the segments are unlinked mid-read.
pub struct RecordReader {
    parts: Vec<ReaderPart>,
    part: usize,
    pos: i64,
}

impl RecordReader {
    fn new(parts: Vec<ReaderPart>) -> Self {
        Self {
            parts,
            part: 0,
            pos: 0,
        }
    }

    /// Collect the remaining payload bytes into an owned [`Bytes`]
    ///
    /// Copies out of the page cache once; useful when the payload must
    /// outlive the read.
    ///
    /// [`Bytes`]: bytes::Bytes
    pub fn to_bytes(&mut self) -> std::io::Result<bytes::Bytes> {
        let mut out = Vec::with_capacity(self.remaining() as usize);
        self.read_to_end(&mut out)?;
        Ok(bytes::Bytes::from(out))
    }

    /// Total number of payload bytes remaining
    pub fn remaining(&self) -> u64 {
        let mut total = 0i64;
        for (i, part) in self.parts.iter().enumerate().skip(self.part) {
            total += part.len;
            if i == self.part {
                total -= self.pos;
            }
        }
        total as u64
    }
}

impl Read for RecordReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.part < self.parts.len() {
            let part = &self.parts[self.part];
            if self.pos >= part.len {
                self.part += 1;
                self.pos = 0;
                continue;
            }
            let n = buf.len().min((part.len - self.pos) as usize);
            if n == 0 {
                return Ok(0);
            }
            let (view, _) = part
                .segment
                .payload_view(part.offset + self.pos, n as i64);
            buf[..n].copy_from_slice(&view[..n]);
            self.pos += n as i64;
            return Ok(n);
        }
        Ok(0)
    }
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("parts", &self.parts.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}
