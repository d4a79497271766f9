//! Configuration for a seglog instance
//!
//! A [`Config`] describes where the log lives on disk and how large its
//! segments grow before rotation. Sizes only affect segments created after
//! the change; segments already on disk carry their size in their header.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SegLogError};
use crate::storage::layout::{nearest_multiple, INDEX_RECORD_SIZE};

/// Default data segment payload size (128 MiB)
pub const DEFAULT_DATA_SEGMENT_SIZE: i64 = 128 * 1024 * 1024;

/// Upper bound used to derive the default index segment size (64 MiB)
const INDEX_SEGMENT_SIZE_CEILING: i64 = 64 * 1024 * 1024;

/// Returns the default index segment size: the largest multiple of the
/// index record width not exceeding 64 MiB, so segments never end with a
/// slot-sized hole.
pub fn default_index_segment_size() -> i64 {
    nearest_multiple(INDEX_SEGMENT_SIZE_CEILING, INDEX_RECORD_SIZE)
}

fn default_data_segment_size() -> i64 {
    DEFAULT_DATA_SEGMENT_SIZE
}

/// Configuration for a [`SegLog`](crate::SegLog) instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory where the log retains its segment and lock files. The
    /// directory is created if missing and must be used by a single live
    /// instance; every file inside it is managed by the log.
    pub work_dir: PathBuf,

    /// Maximum payload size of each data segment in bytes. Does not affect
    /// segments already present on disk.
    #[serde(default = "default_data_segment_size")]
    pub data_segment_size: i64,

    /// Maximum record area size of each index segment in bytes. Each index
    /// record occupies 41 bytes; choosing a multiple of 41 keeps segments
    /// from reserving space they can never use.
    #[serde(default = "default_index_segment_size")]
    pub index_segment_size: i64,
}

impl Config {
    /// Create a configuration for the given work directory with default
    /// segment sizes.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            data_segment_size: DEFAULT_DATA_SEGMENT_SIZE,
            index_segment_size: default_index_segment_size(),
        }
    }

    /// Override the data segment payload size
    pub fn with_data_segment_size(mut self, size: i64) -> Self {
        self.data_segment_size = size;
        self
    }

    /// Override the index segment record area size
    pub fn with_index_segment_size(mut self, size: i64) -> Self {
        self.index_segment_size = size;
        self
    }

    /// Validate the configuration, normalizing zero sizes to their defaults
    pub fn validate(&mut self) -> Result<()> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(SegLogError::config("work_dir is required"));
        }
        if self.data_segment_size == 0 {
            self.data_segment_size = DEFAULT_DATA_SEGMENT_SIZE;
        }
        if self.index_segment_size == 0 {
            self.index_segment_size = default_index_segment_size();
        }
        if self.data_segment_size < 1 {
            return Err(SegLogError::config(format!(
                "data_segment_size must be positive, got {}",
                self.data_segment_size
            )));
        }
        if self.index_segment_size < INDEX_RECORD_SIZE {
            return Err(SegLogError::config(format!(
                "index_segment_size must hold at least one {}-byte record, got {}",
                INDEX_RECORD_SIZE, self.index_segment_size
            )));
        }
        if self.work_dir.exists() && !self.work_dir.is_dir() {
            return Err(SegLogError::config(format!(
                "{}: exists and is not a directory",
                self.work_dir.display()
            )));
        }
        Ok(())
    }

    pub(crate) fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
