//! A cross-platform advisory lock on the store directory.

use crate::error::Result;
use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

const LOCK_FILENAME: &str = ".lock";

/// Held for the lifetime of a context; a second open of the same directory
/// fails instead of corrupting the array.
pub struct DirLock {
    lock_fd: File,
}

impl DirLock {
    /// Take the exclusive lock on `dir`.
    pub fn lock(dir: &Path) -> Result<Self> {
        let lock_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOCK_FILENAME))?;

        match lock_fd.try_lock_exclusive() {
            Ok(()) => Ok(DirLock { lock_fd }),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("store directory {} is locked by another context", dir.display()),
            )
            .into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_fd.unlock() {
            tracing::warn!("failed to unlock store directory: {e}");
        }
    }
}
