#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # seglog
//!
//! An embedded, append-only, on-disk object log. Opaque byte payloads are
//! stored under monotonically increasing record ids; readers iterate from
//! any starting id with a tail-following cursor; space is reclaimed by
//! vacuuming an id prefix.
//!
//! ## Design
//!
//! Storage is split into two parallel sets of fixed-capacity, memory-mapped
//! files inside a work directory owned by exactly one live process:
//!
//! - **Data segments** (`dataNNNN`): payload bytes packed back to back.
//!   Payloads may straddle segment boundaries; reads stitch the pieces back
//!   together without copying through intermediate buffers.
//! - **Index segments** (`indexNNNN`): fixed-width 41-byte records mapping
//!   each id to its payload location, filled contiguously in id order.
//!
//! Segments rotate when full and are destroyed only by vacuum. All files
//! are opened with `O_SYNC` and mutated through shared mappings with
//! explicit msync on close; there is no replay log beyond that.
//!
//! Writes are serialized internally; lookups, counting and cursors run
//! lock-free against the writer and observe every record whose write has
//! returned.
//!
//! ## Quick start
//!
//! ```no_run
//! use seglog::{Config, SegLog};
//!
//! fn main() -> seglog::Result<()> {
//!     let log = SegLog::open(Config::new("/var/lib/myapp/wal"))?;
//!
//!     log.write_object(b"first")?;
//!     log.write_object(b"second")?;
//!
//!     let mut cursor = log.read_objects(0, true);
//!     while cursor.next() {
//!         let payload = cursor.read_to_vec()?;
//!         println!("record {} = {} bytes", cursor.offset(), payload.len());
//!     }
//!
//!     // Drop everything up to and including record 0.
//!     log.vacuum_records(0, true)?;
//!     log.close()
//! }
//! ```
//!
//! ## Modules
//!
//! - [`log`]: the public [`SegLog`] facade
//! - [`config`]: work directory and segment sizing
//! - [`storage`]: the segmented engine (data/index segments, cursor, vacuum)
//! - [`lock`]: single-writer work directory lock
//! - [`error`]: error types and the crate [`Result`] alias
//!
//! ## Feature flags
//!
//! - `metrics`: emit counters and gauges through the `metrics` crate
//!   (`seglog_*` names); disabled by default.

pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod storage;

pub use config::Config;
pub use error::{Result, SegLogError};
pub use log::SegLog;
pub use storage::layout::IndexRecord;
pub use storage::{LogCursor, RecordReader};
