//! Single-writer lock for the work directory
//!
//! A seglog work directory must be owned by exactly one live process. The
//! lock is an advisory exclusive `flock` on a `lock` file inside the
//! directory; the holder's PID is stored in the file as 8 big-endian bytes
//! so a conflicting open can report who owns it.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SegLogError};

/// Name of the lock file inside the work directory
const LOCK_FILE: &str = "lock";

/// Exclusive advisory lock over a work directory
///
/// Holding a `DirLock` guarantees no other `DirLock` exists for the same
/// directory, in this process or any other, for as long as the value lives.
/// The lock is released (and the lock file removed, best-effort) on
/// [`release`](DirLock::release) or drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirLock {
    /// Acquire the lock for `work_dir`
    ///
    /// Fails with [`SegLogError::LockHeld`] when another process (or another
    /// handle in this process) holds the lock; the reported PID is read back
    /// from the lock file.
    pub fn acquire(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_holder_pid(&mut file).unwrap_or(0);
            return Err(SegLogError::LockHeld(pid));
        }

        let pid = std::process::id();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&u64::from(pid).to_be_bytes())?;
        file.sync_data()?;
        debug!(path = %path.display(), pid, "acquired work directory lock");

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Release the lock and remove the lock file
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed unlocking lock file");
            }
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed removing lock file");
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_exact(&mut buf).ok()?;
    u32::try_from(u64::from_be_bytes(buf)).ok()
}
