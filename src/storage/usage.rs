//! Background disk usage sampler
//!
//! Every 10 seconds the sampler stats the segment files in the work
//! directory and publishes their aggregate sizes and counts. It exists for
//! telemetry only: it takes no locks and must never delay appends, reads or
//! vacuums. Shutdown is immediate (dropping the channel wakes the thread).

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::storage::layout::{DATA_SEGMENT_PREFIX, INDEX_SEGMENT_PREFIX};

/// Interval between usage samples
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Handle to the sampling thread
#[derive(Debug)]
pub(crate) struct UsageSampler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl UsageSampler {
    /// Start sampling the given work directory
    #[allow(clippy::expect_used)]
    pub fn spawn(work_dir: PathBuf) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("seglog-usage".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(SAMPLE_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => sample(&work_dir),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed spawning usage sampler thread");

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the sampler and wait for the thread to finish
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UsageSampler {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn sample(work_dir: &Path) {
    let entries = match std::fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %work_dir.display(), error = %e, "failed reading work directory for usage sample");
            return;
        }
    };

    let mut data_bytes = 0u64;
    let mut data_files = 0u64;
    let mut index_bytes = 0u64;
    let mut index_files = 0u64;

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(INDEX_SEGMENT_PREFIX) {
            index_bytes += meta.len();
            index_files += 1;
        } else if name.starts_with(DATA_SEGMENT_PREFIX) {
            data_bytes += meta.len();
            data_files += 1;
        }
    }

    debug!(data_bytes, data_files, index_bytes, index_files, "usage sample");

    #[cfg(feature = "metrics")]
    {
        metrics::gauge!("seglog_data_bytes").set(data_bytes as f64);
        metrics::gauge!("seglog_data_segments").set(data_files as f64);
        metrics::gauge!("seglog_index_bytes").set(index_bytes as f64);
        metrics::gauge!("seglog_index_segments").set(index_files as f64);
    }
}
