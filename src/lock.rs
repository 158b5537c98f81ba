//! Serialisation of tunnel lifecycle operations.
//!
//! Start, stop, restart, activate and every corrective action of the watchdog
//! run while holding one [`LifecycleLock`]. The lock is an in-process mutex
//! backed by an advisory `flock(2)` on a lock file so that administrative
//! commands issued from another process serialise with the daemon too.

use crate::errors::{RouterError, RouterResult};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

const RETRY_STEP: Duration = Duration::from_millis(10);

pub struct LifecycleLock<T> {
    inner: Mutex<T>,
    lock_file: Option<PathBuf>,
}

pub struct LifecycleGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _file: Option<FileLock>,
}

impl<T> Deref for LifecycleGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LifecycleGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> LifecycleLock<T> {
    /// In-process only
    pub fn new(value: T) -> Self {
        LifecycleLock {
            inner: Mutex::new(value),
            lock_file: None,
        }
    }

    /// Also hold an exclusive `flock` on `path` while locked
    pub fn with_lock_file(value: T, path: impl Into<PathBuf>) -> Self {
        LifecycleLock {
            inner: Mutex::new(value),
            lock_file: Some(path.into()),
        }
    }

    /// Wait at most `wait` for the lock, then give up with [`RouterError::Busy`]
    pub fn acquire(&self, wait: Duration) -> RouterResult<LifecycleGuard<'_, T>> {
        let deadline = Instant::now() + wait;
        let guard = loop {
            match self.inner.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Lifecycle lock was poisoned by a panicking holder, recovering");
                    break poisoned.into_inner();
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        debug!("Lifecycle lock busy after {:?}", wait);
                        return Err(RouterError::Busy);
                    }
                    thread::sleep(RETRY_STEP);
                }
            }
        };

        let file = match &self.lock_file {
            Some(path) => Some(FileLock::acquire(path, deadline)?),
            None => None,
        };
        Ok(LifecycleGuard { guard, _file: file })
    }
}

struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, deadline: Instant) -> RouterResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(FileLock { file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                return Err(err.into());
            }
            if Instant::now() >= deadline {
                debug!("{} is held by another process", path.display());
                return Err(RouterError::Busy);
            }
            thread::sleep(RETRY_STEP);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Whether an operator asked for the tunnel to stay down.
///
/// Kept on disk when a state directory is configured, so a `stop` issued by
/// the CLI is honoured by the daemon. Only read or written under the lock.
#[derive(Debug, Clone, Default)]
pub struct OperatorIntent {
    marker: Option<PathBuf>,
    stopped: bool,
}

impl OperatorIntent {
    pub fn in_memory() -> Self {
        OperatorIntent::default()
    }

    pub fn persisted(marker: impl Into<PathBuf>) -> Self {
        let marker = marker.into();
        let stopped = marker.exists();
        OperatorIntent {
            marker: Some(marker),
            stopped,
        }
    }

    pub fn stop_requested(&self) -> bool {
        match &self.marker {
            Some(marker) => marker.exists(),
            None => self.stopped,
        }
    }

    pub fn request_stop(&mut self) -> RouterResult<()> {
        self.stopped = true;
        if let Some(marker) = &self.marker {
            if let Some(dir) = marker.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(marker, b"stopped by operator\n")?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> RouterResult<()> {
        self.stopped = false;
        if let Some(marker) = &self.marker {
            match fs::remove_file(marker) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}
