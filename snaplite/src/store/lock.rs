//! Advisory file locking on the metadata directory.
//!
//! Every state-mutating operation holds the exclusive lock; read-only
//! queries take the shared lock. The lock is scoped: it is released on drop,
//! on every exit path.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{SnapError, SnapResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held lock on the metadata directory.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    mode: LockMode,
}

impl DirLock {
    /// Acquire a lock, blocking until it is granted. An acquisition that
    /// takes a second or more is logged.
    pub fn acquire(dir: &Path, mode: LockMode) -> SnapResult<Self> {
        let start = Instant::now();
        let file = File::open(dir)
            .map_err(|err| SnapError::Lock(format!("open {}: {err}", dir.display())))?;

        let flags = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), flags) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(SnapError::Lock(format!(
                "flock {}: {err}",
                dir.display()
            )));
        }

        let elapsed = start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            tracing::info!(
                dir = %dir.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow metadata lock acquisition"
            );
        }
        Ok(Self { file, mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == LockMode::Exclusive
    }

    /// Fail unless this is the exclusive lock. Mutating store operations
    /// call this before touching any file.
    pub fn require_exclusive(&self) -> SnapResult<()> {
        if self.is_exclusive() {
            Ok(())
        } else {
            Err(SnapError::Lock(
                "operation requires the exclusive metadata lock".to_string(),
            ))
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
