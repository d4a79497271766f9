//! Tail-following record cursor
//!
//! A cursor is a lazy, possibly-infinite sequence over live records in
//! increasing id order. Reaching the tail is not the end: a `next()` that
//! returned false may return true later once new records have been appended.

use std::io::Read;

use crate::error::Result;
use crate::storage::data_manager::RecordReader;
use crate::storage::index::Index;
use crate::storage::layout::IndexRecord;

/// Restartable iterator over records, yielded in increasing id order
///
/// Obtained from [`SegLog::read_objects`](crate::SegLog::read_objects).
/// Typical use alternates [`next`](LogCursor::next) and
/// [`read`](LogCursor::read); `read` applies to the record most recently
/// positioned on and should be called at most once per successful `next`.
#[derive(Debug)]
pub struct LogCursor<'a> {
    index: &'a Index,
    wants: i64,
    record: IndexRecord,
}

impl<'a> LogCursor<'a> {
    pub(crate) fn new(index: &'a Index, wants: i64) -> Self {
        Self {
            index,
            wants,
            record: IndexRecord::default(),
        }
    }

    /// Advance to the next record
    ///
    /// Returns false without advancing when the wanted record does not
    /// exist: purged away, above the current tail, or never written. The
    /// cursor stays usable; a later call may succeed once the log grows.
    pub fn next(&mut self) -> bool {
        if self.index.lookup_meta(self.wants, &mut self.record).is_err() {
            return false;
        }
        if self.record.purged {
            return false;
        }
        self.wants += 1;
        true
    }

    /// Payload reader for the record the cursor is positioned on
    pub fn read(&self) -> Result<RecordReader> {
        self.index.read_record(&self.record)
    }

    /// Convenience wrapper collecting the current payload into a vector
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut reader = self.read()?;
        let mut out = Vec::with_capacity(self.record.size as usize);
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Id of the record just consumed
    ///
    /// Meaningful only after a successful [`next`](LogCursor::next).
    pub fn offset(&self) -> i64 {
        self.wants - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[test]
    fn test_cursor_walks_then_stalls_then_resumes() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_data_segment_size(1024)
            .with_index_segment_size(1024);
        let index = Index::open(&config).unwrap();

        let mut rec = IndexRecord::default();
        index.append(b"a", &mut rec).unwrap();
        index.append(b"b", &mut rec).unwrap();

        let mut cursor = index.read_objects(0, true);
        assert!(cursor.next());
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.read_to_vec().unwrap(), b"a");
        assert!(cursor.next());
        assert_eq!(cursor.read_to_vec().unwrap(), b"b");

        // Stalls at the tail without being consumed.
        assert!(!cursor.next());
        assert!(!cursor.next());

        index.append(b"c", &mut rec).unwrap();
        assert!(cursor.next());
        assert_eq!(cursor.offset(), 2);
        assert_eq!(cursor.read_to_vec().unwrap(), b"c");

        index.close().unwrap();
    }

    #[test]
    fn test_exclusive_cursor_starts_at_right_sibling() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_data_segment_size(1024)
            .with_index_segment_size(1024);
        let index = Index::open(&config).unwrap();

        let mut rec = IndexRecord::default();
        for i in 0..4 {
            index.append(format!("rec{i}").as_bytes(), &mut rec).unwrap();
        }

        let mut cursor = index.read_objects(1, false);
        assert!(cursor.next());
        assert_eq!(cursor.offset(), 2);

        index.close().unwrap();
    }
}
