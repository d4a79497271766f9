//! A single fixed-capacity index segment file
//!
//! Index segments hold a packed array of 41-byte record slots behind a
//! 49-byte header. Within a segment, slots are filled contiguously from
//! slot 0 in strictly increasing record-id order with step +1, so a slot is
//! addressed by subtracting the segment's slot-0 record id.
//!
//! Purging marks a prefix of the slots; when nothing live remains the whole
//! segment is flagged purged and becomes eligible for unlink.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::storage::data_segment::open_segment_file;
use crate::storage::layout::{
    index_record_offsets, index_segment_offsets, index_segment_path, IndexRecord, FLAG_PURGED,
    INDEX_RECORD_SIZE, INDEX_SEGMENT_HEADER_SIZE,
};
use crate::storage::mmap::SharedMmap;

/// One memory-mapped index segment
///
/// Header fields are mirrored in atomics so lookups never take the write
/// mutex; a reader that observes a new `upper_record` also observes the
/// slot bytes it covers (release store after the slot write).
#[derive(Debug)]
pub(crate) struct IndexSegment {
    path: PathBuf,
    _file: File,
    segment_id: i64,
    size: i64,

    lower_record: AtomicI64,
    upper_record: AtomicI64,
    records_count: AtomicI64,
    cursor: AtomicI64,
    purged: AtomicBool,

    /// Record id stored in slot 0; set once by the first write and stable
    /// from then on, so slot addressing never depends on a consistent
    /// snapshot of the other header fields.
    base_record: AtomicI64,

    map: SharedMmap,
    write_mu: Mutex<()>,
}

impl IndexSegment {
    /// Create or open the index segment with the given id
    pub fn open(work_dir: &Path, id: i64, size: i64) -> Result<Self> {
        let path = index_segment_path(work_dir, id);
        let (file, is_new) = open_segment_file(&path, size + INDEX_SEGMENT_HEADER_SIZE)?;
        let map = SharedMmap::map(&file)?;

        let segment = if is_new {
            let segment = Self {
                path,
                _file: file,
                segment_id: id,
                size,
                lower_record: AtomicI64::new(0),
                upper_record: AtomicI64::new(0),
                records_count: AtomicI64::new(0),
                cursor: AtomicI64::new(0),
                purged: AtomicBool::new(false),
                base_record: AtomicI64::new(0),
                map,
                write_mu: Mutex::new(()),
            };
            segment.flush_header();
            segment
        } else {
            // Header is authoritative for everything, including the size.
            let flags = map.get_u8(index_segment_offsets::FLAGS);
            let upper = map.get_i64(index_segment_offsets::UPPER_RECORD);
            let cursor = map.get_i64(index_segment_offsets::CURSOR);
            // Purging advances LowerRecord past dead records but slots never
            // move, so the slot-0 anchor is recovered from the write cursor:
            // slots are filled contiguously in id order up to UpperRecord.
            let slots = cursor / INDEX_RECORD_SIZE;
            let base = if slots > 0 { upper - slots + 1 } else { 0 };
            Self {
                path,
                segment_id: map.get_i64(index_segment_offsets::SEGMENT_ID),
                size: map.get_i64(index_segment_offsets::SIZE),
                lower_record: AtomicI64::new(map.get_i64(index_segment_offsets::LOWER_RECORD)),
                upper_record: AtomicI64::new(upper),
                records_count: AtomicI64::new(map.get_i64(index_segment_offsets::RECORDS_COUNT)),
                cursor: AtomicI64::new(cursor),
                purged: AtomicBool::new(flags & FLAG_PURGED != 0),
                base_record: AtomicI64::new(base),
                map,
                _file: file,
                write_mu: Mutex::new(()),
            }
        };
        trace!(segment_id = segment.segment_id, is_new, "opened index segment");

        Ok(segment)
    }

    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn lower_record(&self) -> i64 {
        self.lower_record.load(Ordering::Acquire)
    }

    pub fn upper_record(&self) -> i64 {
        self.upper_record.load(Ordering::Acquire)
    }

    pub fn records_count(&self) -> i64 {
        self.records_count.load(Ordering::Acquire)
    }

    pub fn is_purged(&self) -> bool {
        self.purged.load(Ordering::Acquire)
    }

    /// Mark the whole segment purged and persist the header
    pub fn set_purged(&self) {
        self.purged.store(true, Ordering::Release);
        self.flush_header();
    }

    /// Write the in-memory header into the mapping
    pub fn flush_header(&self) {
        self.map
            .put_i64(index_segment_offsets::SEGMENT_ID, self.segment_id);
        self.map.put_i64(index_segment_offsets::SIZE, self.size);
        self.map.put_i64(
            index_segment_offsets::LOWER_RECORD,
            self.lower_record.load(Ordering::Acquire),
        );
        self.map.put_i64(
            index_segment_offsets::UPPER_RECORD,
            self.upper_record.load(Ordering::Acquire),
        );
        self.map.put_i64(
            index_segment_offsets::RECORDS_COUNT,
            self.records_count.load(Ordering::Acquire),
        );
        self.map.put_i64(
            index_segment_offsets::CURSOR,
            self.cursor.load(Ordering::Acquire),
        );
        let flags = if self.is_purged() { FLAG_PURGED } else { 0 };
        self.map.put_u8(index_segment_offsets::FLAGS, flags);
    }

    fn slot_offset(&self, record_id: i64) -> usize {
        let slot = record_id - self.base_record.load(Ordering::Acquire);
        (INDEX_SEGMENT_HEADER_SIZE + slot * INDEX_RECORD_SIZE) as usize
    }

    /// Whether the given record id falls in this segment's live range
    pub fn contains_record(&self, id: i64) -> bool {
        if self.records_count() == 0 {
            return false;
        }
        id >= self.lower_record() && id <= self.upper_record()
    }

    /// Decode the record with the given id into `rec`
    ///
    /// Returns false when the segment does not contain the id.
    pub fn load_record(&self, id: i64, rec: &mut IndexRecord) -> bool {
        if !self.contains_record(id) {
            return false;
        }
        let offset = self.slot_offset(id);
        *rec = IndexRecord::decode(self.map.slice(offset, INDEX_RECORD_SIZE as usize));
        true
    }

    /// Whether another record slot fits in the record area
    pub fn fits_record(&self) -> bool {
        self.cursor.load(Ordering::Acquire) + INDEX_RECORD_SIZE <= self.size
    }

    /// Append a record slot and update the header
    pub fn write_record(&self, rec: &IndexRecord) {
        let _guard = self.write_mu.lock();

        let cursor = self.cursor.load(Ordering::Relaxed);
        let offset = (INDEX_SEGMENT_HEADER_SIZE + cursor) as usize;
        self.map.write_at(offset, &rec.encode());

        if cursor == 0 {
            self.base_record.store(rec.record_id, Ordering::Release);
            self.lower_record.store(rec.record_id, Ordering::Release);
        }
        // Slot bytes are published before the range that covers them; the
        // count goes last so a reader that observes the record also observes
        // everything the lookup path depends on.
        self.upper_record.store(rec.record_id, Ordering::Release);
        self.cursor
            .store(cursor + INDEX_RECORD_SIZE, Ordering::Release);
        self.records_count.fetch_add(1, Ordering::AcqRel);
        self.flush_header();
    }

    /// Purge every record in `[lower_record, id]`
    ///
    /// Marks the affected slots, recounts the live records, promotes the
    /// whole segment to purged when none remain, and otherwise advances
    /// `lower_record` to the smallest live id. A segment that cannot fit
    /// another record and is purged up to its last id is flagged purged
    /// wholesale without touching the slots.
    pub fn purge_from(&self, id: i64) {
        let _guard = self.write_mu.lock();

        if !self.fits_record() && id == self.upper_record() {
            self.purged.store(true, Ordering::Release);
            self.lower_record.store(-1, Ordering::Release);
            self.records_count.store(0, Ordering::Release);
            self.flush_header();
            return;
        }

        let lower = self.lower_record();
        let upper = self.upper_record();
        for record_id in lower..=id.min(upper) {
            self.set_slot_purged(record_id);
        }

        let mut live = 0;
        let mut new_lower = None;
        for record_id in lower..=upper {
            if !self.slot_is_purged(record_id) {
                live += 1;
                if new_lower.is_none() {
                    new_lower = Some(record_id);
                }
            }
        }

        self.records_count.store(live, Ordering::Release);
        if live == 0 {
            self.purged.store(true, Ordering::Release);
            self.lower_record.store(-1, Ordering::Release);
        } else if let Some(new_lower) = new_lower {
            self.lower_record.store(new_lower, Ordering::Release);
        }
        self.flush_header();
    }

    fn set_slot_purged(&self, record_id: i64) {
        let offset = self.slot_offset(record_id) + index_record_offsets::FLAGS;
        let flags = self.map.get_u8(offset);
        self.map.put_u8(offset, flags | FLAG_PURGED);
    }

    fn slot_is_purged(&self, record_id: i64) -> bool {
        let offset = self.slot_offset(record_id) + index_record_offsets::FLAGS;
        self.map.get_u8(offset) & FLAG_PURGED != 0
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: i64) -> IndexRecord {
        IndexRecord {
            record_id: id,
            data_segment_start_id: id,
            data_segment_end_id: id,
            data_segment_offset: id * 10,
            size: 10,
            purged: false,
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 * 4).unwrap();

        assert!(!seg.contains_record(0));
        seg.write_record(&record(0));
        seg.write_record(&record(1));

        assert_eq!(seg.lower_record(), 0);
        assert_eq!(seg.upper_record(), 1);
        assert_eq!(seg.records_count(), 2);

        let mut rec = IndexRecord::default();
        assert!(seg.load_record(1, &mut rec));
        assert_eq!(rec, record(1));
        assert!(!seg.load_record(2, &mut rec));
    }

    #[test]
    fn test_fits_record() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 + 3).unwrap();
        assert!(seg.fits_record());
        seg.write_record(&record(7));
        assert!(!seg.fits_record());
    }

    #[test]
    fn test_nonzero_base_lookup() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 2, 41 * 8).unwrap();

        for id in 100..105 {
            seg.write_record(&record(id));
        }
        assert!(seg.contains_record(100));
        assert!(seg.contains_record(104));
        assert!(!seg.contains_record(99));

        let mut rec = IndexRecord::default();
        assert!(seg.load_record(103, &mut rec));
        assert_eq!(rec.record_id, 103);
    }

    #[test]
    fn test_purge_prefix_keeps_tail_addressable() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 * 10).unwrap();
        for id in 0..6 {
            seg.write_record(&record(id));
        }

        seg.purge_from(2);
        assert!(!seg.is_purged());
        assert_eq!(seg.records_count(), 3);
        assert_eq!(seg.lower_record(), 3);
        assert!(!seg.contains_record(2));

        // Surviving records still resolve to the right slots.
        let mut rec = IndexRecord::default();
        for id in 3..6 {
            assert!(seg.load_record(id, &mut rec), "record {id} lost");
            assert_eq!(rec.record_id, id);
            assert!(!rec.purged);
        }

        // A second purge in the same segment advances further.
        seg.purge_from(4);
        assert_eq!(seg.records_count(), 1);
        assert_eq!(seg.lower_record(), 5);
        assert!(seg.load_record(5, &mut rec));
        assert_eq!(rec.record_id, 5);
    }

    #[test]
    fn test_purge_all_marks_segment() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 * 4).unwrap();
        for id in 0..3 {
            seg.write_record(&record(id));
        }

        seg.purge_from(2);
        assert!(seg.is_purged());
        assert_eq!(seg.records_count(), 0);
        assert!(!seg.contains_record(0));
    }

    #[test]
    fn test_purge_full_segment_fast_path() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 + 3).unwrap();
        seg.write_record(&record(25));
        assert!(!seg.fits_record());

        seg.purge_from(25);
        assert!(seg.is_purged());
        assert_eq!(seg.records_count(), 0);
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let seg = IndexSegment::open(dir.path(), 1, 41 * 8).unwrap();
            for id in 10..14 {
                seg.write_record(&record(id));
            }
            seg.purge_from(10);
            seg.close().unwrap();
        }

        let seg = IndexSegment::open(dir.path(), 1, 41 * 8).unwrap();
        assert_eq!(seg.segment_id(), 1);
        assert_eq!(seg.lower_record(), 11);
        assert_eq!(seg.upper_record(), 13);
        assert_eq!(seg.records_count(), 3);
        assert!(!seg.is_purged());

        // Slot addressing still works after the reopen.
        let mut rec = IndexRecord::default();
        assert!(seg.load_record(12, &mut rec));
        assert_eq!(rec.record_id, 12);
    }

    #[test]
    fn test_unlink_removes_file() {
        let dir = tempdir().unwrap();
        let seg = IndexSegment::open(dir.path(), 0, 41 * 2).unwrap();
        let path = dir.path().join("index0000");
        assert!(path.exists());
        seg.unlink().unwrap();
        assert!(!path.exists());
    }
}
