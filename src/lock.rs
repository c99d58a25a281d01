//! Advisory file lock guarding the active VPN state.
//!
//! The lock is a `flock(2)` on an open descriptor. Dropping the guard closes
//! the descriptor, which releases the lock; the kernel does the same if the
//! holding process dies, so a crash can never leave the controller wedged.

use crate::error::{HubError, HubResult};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Try to take the exclusive lock without waiting.
    ///
    /// Returns `HubError::Busy` when another holder (in this or any other
    /// process) has it.
    pub fn try_acquire(path: &Path) -> HubResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        #[cfg(unix)]
        {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    return Err(HubError::Busy(
                        "another VPN profile operation is in progress, try again later".to_string(),
                    ));
                }
                return Err(HubError::Io(err));
            }
        }

        debug!("Acquired lock {:?}", path);
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!("Released lock {:?}", self.path);
    }
}
