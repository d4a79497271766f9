//! Error types for seglog
//!
//! All fallible operations in the crate return [`Result`], built on a single
//! [`SegLogError`] enum. I/O errors are wrapped transparently; the remaining
//! variants describe conditions the storage engine itself detects.

use thiserror::Error;

/// Result type alias for seglog operations
pub type Result<T> = std::result::Result<T, SegLogError>;

/// Main error type for seglog
#[derive(Error, Debug)]
pub enum SegLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The record id is above the tail, was never allocated, or has been
    /// purged (either by slot flag or by segment unlink).
    #[error("record {0} not found")]
    NotFound(i64),

    /// A read resolved to a data segment that no longer exists. Index
    /// records only reference live segments, so this indicates corruption.
    #[error("data segment {0} is missing")]
    SegmentMissing(i64),

    #[error("configuration error: {0}")]
    Config(String),

    /// The work directory lock is held by another live process.
    #[error("work directory is locked by process {0}")]
    LockHeld(u32),
}

impl SegLogError {
    /// Create a configuration error with context
    pub fn config(detail: impl Into<String>) -> Self {
        SegLogError::Config(detail.into())
    }

    /// Returns true when the error means "no such record" rather than a
    /// storage failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SegLogError::NotFound(_))
    }
}
