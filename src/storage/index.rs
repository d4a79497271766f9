//! The record index: id assignment, lookup, counting, and vacuum
//!
//! The index owns the sorted set of index segments, the monotonically
//! increasing record counter, and the embedded [`DataManager`]. Appends,
//! vacuums, and close are serialized by a write mutex; lookups, counting and
//! cursor advancement run lock-free against writers (a record whose append
//! returned is immediately visible).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SegLogError};
use crate::storage::cursor::LogCursor;
use crate::storage::data_manager::{DataManager, RecordReader};
use crate::storage::index_segment::IndexSegment;
use crate::storage::layout::{parse_segment_id, IndexRecord, INDEX_SEGMENT_PREFIX};
use crate::storage::usage::UsageSampler;

/// The two-level record index over the segmented store
#[derive(Debug)]
pub(crate) struct Index {
    work_dir: PathBuf,
    segment_size: i64,

    segments: RwLock<BTreeMap<i64, Arc<IndexSegment>>>,
    current: RwLock<Option<Arc<IndexSegment>>>,
    min_segment: AtomicI64,
    max_segment: AtomicI64,

    /// Highest assigned record id, or -1 while the log is empty
    max_record: AtomicI64,

    dm: DataManager,
    write_mu: Mutex<()>,
    sampler: Mutex<Option<UsageSampler>>,
}

impl Index {
    /// Open the index (and the data layer) for a work directory
    pub fn open(config: &Config) -> Result<Self> {
        let work_dir = config.work_dir();
        if !work_dir.exists() {
            std::fs::create_dir_all(work_dir)?;
        } else if !work_dir.is_dir() {
            return Err(SegLogError::config(format!(
                "{}: exists and is not a directory",
                work_dir.display()
            )));
        }

        let dm = DataManager::open(work_dir, config.data_segment_size)?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(work_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = parse_segment_id(&name.to_string_lossy(), INDEX_SEGMENT_PREFIX)? {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        info!(segments = ids.len(), "loading index segments");

        let index = Self {
            work_dir: work_dir.to_path_buf(),
            segment_size: config.index_segment_size,
            segments: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
            min_segment: AtomicI64::new(-1),
            max_segment: AtomicI64::new(-1),
            max_record: AtomicI64::new(-1),
            dm,
            write_mu: Mutex::new(()),
            sampler: Mutex::new(None),
        };

        for &id in &ids {
            let segment = Arc::new(IndexSegment::open(work_dir, id, config.index_segment_size)?);
            // Reopening an empty segment must not resurrect record id 0 as
            // "assigned", so only seed the counter from populated segments.
            let seed = if segment.records_count() > 0 {
                segment.upper_record()
            } else {
                -1
            };
            index.max_record.store(seed, Ordering::Release);
            index.segments.write().insert(id, segment.clone());
            *index.current.write() = Some(segment);
        }
        if let (Some(&min), Some(&max)) = (ids.first(), ids.last()) {
            index.min_segment.store(min, Ordering::Release);
            index.max_segment.store(max, Ordering::Release);
        }

        if ids.is_empty() {
            let _guard = index.write_mu.lock();
            index.rotate_locked()?;
        }

        *index.sampler.lock() = Some(UsageSampler::spawn(index.work_dir.clone()));

        Ok(index)
    }

    /// Create a fresh index segment and make it current
    ///
    /// Caller must hold the write mutex.
    fn rotate_locked(&self) -> Result<Arc<IndexSegment>> {
        let next_id = match self.current.read().as_ref() {
            Some(current) => current.segment_id() + 1,
            None => 0,
        };
        let segment = Arc::new(IndexSegment::open(
            &self.work_dir,
            next_id,
            self.segment_size,
        )?);
        self.segments.write().insert(next_id, segment.clone());
        *self.current.write() = Some(segment.clone());
        self.max_segment.store(next_id, Ordering::Release);
        if next_id == 0 {
            self.min_segment.store(0, Ordering::Release);
            self.max_record.store(-1, Ordering::Release);
        }
        debug!(segment_id = next_id, "rotated index segment");
        Ok(segment)
    }

    // The current pointer is only None transiently inside vacuum, which
    // holds the write mutex; every caller holds it too.
    #[allow(clippy::expect_used)]
    fn current_segment(&self) -> Arc<IndexSegment> {
        self.current
            .read()
            .as_ref()
            .expect("index always keeps a current segment")
            .clone()
    }

    /// Highest assigned record id, -1 while empty
    pub fn max_record(&self) -> i64 {
        self.max_record.load(Ordering::Acquire)
    }

    /// Append a payload, assigning the next record id
    ///
    /// The data layer is written first; the index slot second; the record
    /// counter advances only after both succeeded, so observers never see an
    /// index slot pointing at unwritten data. A data-layer failure leaves
    /// the index unchanged (any bytes it managed to place become dead tail
    /// bytes that no record references).
    pub fn append(&self, data: &[u8], rec: &mut IndexRecord) -> Result<i64> {
        let _guard = self.write_mu.lock();

        #[cfg(feature = "metrics")]
        metrics::counter!("seglog_appends_total").increment(1);

        let mut current = self.current_segment();
        if !current.fits_record() {
            current = self.rotate_locked()?;
        }

        let record_id = self.max_record.load(Ordering::Relaxed) + 1;
        rec.record_id = record_id;
        rec.size = data.len() as i64;
        rec.purged = false;

        self.dm.write(data, rec)?;

        current.write_record(rec);
        self.max_record.store(record_id, Ordering::Release);

        Ok(record_id)
    }

    /// Find the segment whose live range contains the given record id
    pub fn segment_for_id(&self, id: i64) -> Option<Arc<IndexSegment>> {
        self.segments
            .read()
            .values()
            .find(|segment| segment.contains_record(id))
            .cloned()
    }

    /// Load the metadata of a record by id
    pub fn lookup_meta(&self, id: i64, rec: &mut IndexRecord) -> Result<()> {
        let segment = self
            .segment_for_id(id)
            .ok_or(SegLogError::NotFound(id))?;
        if !segment.load_record(id, rec) {
            return Err(SegLogError::NotFound(id));
        }
        Ok(())
    }

    /// Build a payload reader for an already-resolved record
    ///
    /// Callers must check the record's purged flag first.
    pub fn read_record(&self, rec: &IndexRecord) -> Result<RecordReader> {
        self.dm.read(rec)
    }

    /// Whether the log holds no live records
    pub fn is_empty(&self) -> bool {
        if self.min_segment.load(Ordering::Acquire) == 0
            && self.max_segment.load(Ordering::Acquire) == 0
        {
            // Racing a vacuum may briefly leave no current segment; fall
            // through to the per-segment scan in that case.
            if let Some(current) = self.current.read().as_ref() {
                return current.records_count() == 0;
            }
        }
        self.segments
            .read()
            .values()
            .all(|segment| segment.is_purged())
    }

    /// Count the records at or after the given id
    ///
    /// The total is the slot count of the tail: `upper - id` within the
    /// starting segment plus the record counts of every successor segment
    /// (plus one when inclusive). Mid-range purged slots in the starting
    /// segment are not subtracted.
    pub fn count_objects(&self, id: i64, inclusive: bool) -> i64 {
        let Some(segment) = self.segment_for_id(id) else {
            return 0;
        };
        let mut total = segment.upper_record() - id;

        let segments = self.segments.read();
        let mut next_id = segment.segment_id() + 1;
        while let Some(next) = segments.get(&next_id) {
            total += next.records_count();
            next_id += 1;
        }

        if inclusive {
            total += 1;
        }
        total
    }

    /// Create a cursor positioned at `id` (or its right sibling)
    pub fn read_objects(&self, id: i64, inclusive: bool) -> LogCursor<'_> {
        let wants = if inclusive { id } else { id + 1 };
        LogCursor::new(self, wants)
    }

    /// Purge every record up to (and optionally including) the given id,
    /// then reclaim the segments no longer referenced
    pub fn vacuum_objects(&self, id: i64, inclusive: bool) -> Result<()> {
        let _guard = self.write_mu.lock();

        #[cfg(feature = "metrics")]
        metrics::counter!("seglog_vacuums_total").increment(1);

        let id = if inclusive { id } else { id - 1 };
        if id < 0 {
            return Ok(());
        }

        info!(id, "vacuum starting");

        let Some(start) = self.segment_for_id(id) else {
            warn!(id, "attempt to vacuum from non-existing record");
            return Ok(());
        };

        let mut to_remove = Vec::new();

        debug!(segment_id = start.segment_id(), "vacuum starting at segment");
        start.purge_from(id);
        if start.is_purged() {
            to_remove.push(start.segment_id());
            debug!(
                segment_id = start.segment_id(),
                "segment fully purged by vacuum"
            );
        }

        // Everything before the starting segment lies wholly at or before
        // the purge point.
        {
            let segments = self.segments.read();
            let mut segment_id = start.segment_id() - 1;
            while let Some(segment) = segments.get(&segment_id) {
                segment.set_purged();
                debug!(segment_id, "marking segment as purged");
                to_remove.push(segment_id);
                segment_id -= 1;
            }
        }

        let in_use = self.data_segments_in_use();
        self.dm.vacuum(&in_use)?;

        for segment_id in to_remove {
            let Some(segment) = self.segments.write().remove(&segment_id) else {
                warn!(segment_id, "could not find segment marked for removal");
                continue;
            };
            debug!(segment_id, "unlinking index segment");
            segment.unlink()?;
            let mut current = self.current.write();
            if current
                .as_ref()
                .is_some_and(|c| c.segment_id() == segment_id)
            {
                *current = None;
            }
        }

        if self.segments.read().is_empty() {
            debug!("all index segments cleared during vacuum, recreating initial segment");
            self.rotate_locked()?;
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

        {
            let mut current = self.current.write();
            if current.is_none() {
                *current = self.segments.read().get(&max).cloned();
            }
        }

        // Record ids never reuse while records remain; only a log emptied by
        // the vacuum resets its counter.
        if self.current_segment().records_count() == 0 {
            self.max_record.store(-1, Ordering::Release);
        }

        info!("vacuum finished");
        Ok(())
    }

    /// Union of the data segment ranges referenced by live records
    fn data_segments_in_use(&self) -> HashSet<i64> {
        let mut in_use = HashSet::new();
        let mut rec = IndexRecord::default();
        for segment in self.segments.read().values() {
            if segment.is_purged() {
                continue;
            }
            for record_id in segment.lower_record()..=segment.upper_record() {
                if !segment.load_record(record_id, &mut rec) || rec.purged {
                    continue;
                }
                for data_id in rec.data_segment_start_id..=rec.data_segment_end_id {
                    in_use.insert(data_id);
                }
            }
        }
        in_use
    }

    /// Stop the sampler, flush both layers, return the first error
    pub fn close(&self) -> Result<()> {
        let _guard = self.write_mu.lock();

        if let Some(sampler) = self.sampler.lock().take() {
            sampler.stop();
        }

        let mut first_err = self.dm.close().err();

        for (id, segment) in self.segments.read().iter() {
            if let Err(e) = segment.close() {
                warn!(segment_id = id, error = %e, "failed closing index segment");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
