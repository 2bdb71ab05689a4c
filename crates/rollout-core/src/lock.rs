//! Setup lock capability.
//!
//! Every mutation of the version store or registration table must hold
//! the per-scope setup lock. The lock is modeled as a capability: the
//! [`SetupLock`] trait hands out a [`SetupGuard`], and store mutation
//! APIs take `&SetupGuard` as a witness so the requirement is visible
//! in the signature rather than enforced by convention.
//!
//! Cross-scope operations must acquire the system-scope lock before
//! the user-scope lock, always, to avoid deadlock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

/// Interval between lock acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Errors acquiring the setup lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be acquired within the timeout.
    ///
    /// Non-fatal: the caller aborts its mutation, reports the
    /// corresponding installer-category error, and retries on the next
    /// wake.
    #[error("timed out acquiring setup lock after {0:?}")]
    Timeout(Duration),

    /// The lock file could not be opened.
    #[error("setup lock i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Witness that the setup lock is held. Released on drop.
pub struct SetupGuard {
    _hold: Box<dyn Send>,
}

impl std::fmt::Debug for SetupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupGuard").finish_non_exhaustive()
    }
}

/// Scoped cross-process mutual exclusion.
pub trait SetupLock: Send + Sync {
    /// Acquire the lock, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another holder did not release
    /// within the timeout.
    fn acquire(&self, timeout: Duration) -> Result<SetupGuard, LockError>;
}

/// File-backed setup lock using an advisory `flock`-style lock.
///
/// The lock file is created on first use and never removed; only the
/// advisory lock on it matters.
#[derive(Debug)]
pub struct FileSetupLock {
    path: PathBuf,
}

struct FileHold {
    file: File,
}

impl Drop for FileHold {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release setup lock");
        }
    }
}

impl FileSetupLock {
    /// Create a lock handle for the lock file at `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SetupLock for FileSetupLock {
    fn acquire(&self, timeout: Duration) -> Result<SetupGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(SetupGuard {
                        _hold: Box::new(FileHold { file }),
                    });
                },
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || fs2::lock_contended_error().kind() == err.kind() =>
                {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout(timeout));
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// In-process setup lock for tests.
#[derive(Debug, Default)]
pub struct MemorySetupLock {
    held: Arc<AtomicBool>,
}

struct MemoryHold {
    held: Arc<AtomicBool>,
}

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

impl MemorySetupLock {
    /// Create an unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SetupLock for MemorySetupLock {
    fn acquire(&self, timeout: Duration) -> Result<SetupGuard, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .held
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(SetupGuard {
                    _hold: Box::new(MemoryHold {
                        held: Arc::clone(&self.held),
                    }),
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// A lock that always times out, for exercising abort paths in tests.
#[derive(Debug, Default)]
pub struct AlwaysBusyLock;

impl SetupLock for AlwaysBusyLock {
    fn acquire(&self, timeout: Duration) -> Result<SetupGuard, LockError> {
        Err(LockError::Timeout(timeout))
    }
}
