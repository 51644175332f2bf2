//! Cross-process advisory lock guarding the single index writer.
//!
//! The lock is an exclusive `fs2` lock on a small file inside the index
//! directory. Acquisition either blocks, polls until a deadline, or fails on the
//! first contended attempt. The holder's process id is written into the file to
//! help operators find a stuck writer.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::constants::LOCK_POLL_INTERVAL;
use crate::error::{FramewiseError, Result};

/// An exclusive lock held for the lifetime of the value.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`.
    ///
    /// `None` blocks until the lock is free. `Some(Duration::ZERO)` makes a single
    /// attempt. Any other duration polls until it elapses.
    pub fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match timeout {
            None => file.lock_exclusive()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(err) if is_contended(&err) => {
                            let now = Instant::now();
                            if now >= deadline {
                                tracing::warn!(path = %path.display(), "writer lock is held elsewhere");
                                return Err(FramewiseError::WriteLocked {
                                    path: path.to_path_buf(),
                                });
                            }
                            thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.record_owner()?;
        tracing::debug!(path = %lock.path.display(), "writer lock acquired");
        Ok(lock)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly, surfacing unlock errors.
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        tracing::debug!(path = %self.path.display(), "writer lock released");
        Ok(())
    }

    fn record_owner(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{}", std::process::id())?;
        self.file.flush()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_fast_with_zero_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("writer.lock");
        let held = FileLock::acquire(&path, Some(Duration::ZERO)).unwrap();

        let err = FileLock::acquire(&path, Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, FramewiseError::WriteLocked { .. }));
        drop(held);
    }

    #[test]
    fn polling_waits_for_the_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("writer.lock");
        let _held = FileLock::acquire(&path, None).unwrap();

        let started = Instant::now();
        let err = FileLock::acquire(&path, Some(Duration::from_millis(120))).unwrap_err();
        assert!(matches!(err, FramewiseError::WriteLocked { .. }));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("writer.lock");
        let lock = FileLock::acquire(&path, Some(Duration::ZERO)).unwrap();
        lock.release().unwrap();

        let again = FileLock::acquire(&path, Some(Duration::ZERO)).unwrap();
        let owner = std::fs::read_to_string(again.path()).unwrap();
        assert_eq!(owner, std::process::id().to_string());
    }
}
