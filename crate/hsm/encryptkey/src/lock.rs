//! Mutual exclusion between processes sharing one HSM.
//!
//! The lock token is a directory: `mkdir` is atomic on a local filesystem,
//! so whoever creates it owns the device until the directory is removed.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{HError, HResult, config::LockConfig};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HsmLock {
    path: PathBuf,
    timeout_ticks: u64,
    poll_interval: Duration,
}

impl HsmLock {
    /// A lock on `path` waiting at most `timeout_secs` one-second ticks
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P, timeout_secs: u64) -> Self {
        Self {
            path: path.into(),
            timeout_ticks: timeout_secs,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.path.clone(), config.timeout_secs)
    }

    /// Change the length of one tick
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the lock directory to disappear, then create it.
    ///
    /// When the wait times out the directory is created anyway: if the other
    /// holder is still there the creation fails and the failure is returned.
    /// Two waiters seeing the directory vanish in the same tick race on the
    /// creation; the loser gets the error too.
    ///
    /// # Errors
    ///
    /// Fails with `HError::Lock` when the lock directory cannot be created,
    /// which includes the case of another holder outliving the timeout.
    pub fn acquire(&self) -> HResult<HsmLockGuard> {
        let mut remaining = self.timeout_ticks;
        while remaining > 0 {
            remaining -= 1;
            if self.path.exists() {
                trace!(
                    "HSM lock {} is held, {remaining} ticks left",
                    self.path.display()
                );
                thread::sleep(self.poll_interval);
            } else {
                break;
            }
        }
        if remaining == 0 && self.path.exists() {
            warn!(
                "Timeout waiting for the HSM lock {}, trying to take it anyway",
                self.path.display()
            );
        }

        fs::create_dir(&self.path).map_err(|e| {
            let reason = if e.kind() == io::ErrorKind::AlreadyExists {
                "it is held by another process".to_owned()
            } else {
                e.to_string()
            };
            HError::Lock(format!(
                "unable to create the HSM lock directory {}: {reason}",
                self.path.display()
            ))
        })?;
        debug!("Acquired the HSM lock {}", self.path.display());

        Ok(HsmLockGuard {
            path: self.path.clone(),
            released: false,
        })
    }
}

/// Ownership of the lock directory. Dropping the guard releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HsmLockGuard {
    path: PathBuf,
    released: bool,
}

impl HsmLockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock directory, reporting failures
    ///
    /// # Errors
    ///
    /// Returns `HError::Lock` if the lock directory cannot be removed.
    pub fn release(mut self) -> HResult<()> {
        self.remove()
    }

    fn remove(&mut self) -> HResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        fs::remove_dir(&self.path).map_err(|e| {
            HError::Lock(format!(
                "unable to remove the HSM lock directory {}: {e}",
                self.path.display()
            ))
        })?;
        debug!("Released the HSM lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for HsmLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("{e}");
        }
    }
}
