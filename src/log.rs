//! The public log facade
//!
//! [`SegLog`] ties the pieces together: it validates the configuration,
//! takes the single-writer lock on the work directory, and exposes the
//! record-level operations backed by the storage engine.

use std::io::Read;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SegLogError};
use crate::lock::DirLock;
use crate::storage::cursor::LogCursor;
use crate::storage::data_manager::RecordReader;
use crate::storage::index::Index;
use crate::storage::layout::IndexRecord;

/// An embedded append-only object log
///
/// Payloads are stored under monotonically increasing record ids, starting
/// at 0. The log is owned by a single process at a time (enforced by an
/// advisory lock on the work directory); within the process, all methods
/// take `&self` and writes are serialized internally.
///
/// ```no_run
/// use seglog::{Config, SegLog};
///
/// fn main() -> seglog::Result<()> {
///     let log = SegLog::open(Config::new("/var/lib/myapp/wal"))?;
///
///     let id = log.write_object(b"hello")?;
///
///     let mut cursor = log.read_objects(id, true);
///     while cursor.next() {
///         println!("record {}: {} bytes", cursor.offset(), cursor.read_to_vec()?.len());
///     }
///
///     log.close()
/// }
/// ```
#[derive(Debug)]
pub struct SegLog {
    index: Index,
    lock: Option<DirLock>,
}

impl SegLog {
    /// Open (or create) the log rooted at the configured work directory
    ///
    /// Fails with [`SegLogError::LockHeld`] when another process owns the
    /// directory, or [`SegLogError::Config`] when the configuration is
    /// invalid.
    pub fn open(mut config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            work_dir = %config.work_dir.display(),
            data_segment_size = config.data_segment_size,
            index_segment_size = config.index_segment_size,
            "log is initializing"
        );

        if !config.work_dir.exists() {
            std::fs::create_dir_all(&config.work_dir)?;
        }

        let lock = DirLock::acquire(config.work_dir())?;
        let index = match Index::open(&config) {
            Ok(index) => index,
            Err(e) => {
                lock.release();
                return Err(e);
            }
        };
        debug!("log initialization completed");

        Ok(Self {
            index,
            lock: Some(lock),
        })
    }

    /// Append a payload, returning its assigned record id
    pub fn write_object(&self, data: &[u8]) -> Result<i64> {
        let mut rec = IndexRecord::default();
        self.index.append(data, &mut rec)
    }

    /// Read a previously stored payload by record id
    ///
    /// Returns a sequential reader over the payload bytes, or
    /// [`SegLogError::NotFound`] when the record never existed or has been
    /// vacuumed.
    pub fn read_object(&self, id: i64) -> Result<RecordReader> {
        let mut rec = IndexRecord::default();
        self.index.lookup_meta(id, &mut rec)?;
        if rec.purged {
            return Err(SegLogError::NotFound(id));
        }
        self.index.read_record(&rec)
    }

    /// Convenience wrapper collecting a payload into a vector
    pub fn read_object_to_vec(&self, id: i64) -> Result<Vec<u8>> {
        let mut reader = self.read_object(id)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Cursor over records starting at `id`, or its right sibling when not
    /// inclusive
    pub fn read_objects(&self, id: i64, inclusive: bool) -> LogCursor<'_> {
        self.index.read_objects(id, inclusive)
    }

    /// Number of records at (when inclusive) or after the given id
    pub fn count_objects(&self, id: i64, inclusive: bool) -> i64 {
        self.index.count_objects(id, inclusive)
    }

    /// Purge all records up to (and, when inclusive, including) the given
    /// id, reclaiming segments no longer referenced
    pub fn vacuum_records(&self, id: i64, inclusive: bool) -> Result<()> {
        self.index.vacuum_objects(id, inclusive)
    }

    /// Id of the latest written record (0 while the log is empty)
    pub fn current_record_id(&self) -> i64 {
        self.index.max_record().max(0)
    }

    /// Whether the log currently stores no live records
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Flush all segments to disk, release the lock and consume the log
    pub fn close(mut self) -> Result<()> {
        let result = self.index.close();
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
        result
    }
}
