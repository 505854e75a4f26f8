//! Exclusive ownership of a storage directory.
//!
//! The lock file holds the owner's PID. A lock left behind by a dead process
//! is reported, never stolen: an operator has to check the directory and
//! remove the file by hand.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name of the lock file inside the storage directory.
pub const LOCK_FILE_NAME: &str = "scrawl.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("storage directory is in use by running process {pid} ({path})")]
    Held { pid: u32, path: PathBuf },
    #[error(
        "stale lock {path} left by process {pid}, which is no longer running; \
         remove it manually once no other server uses the directory"
    )]
    Stale { pid: u32, path: PathBuf },
    #[error("unreadable lock file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("lock file I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Take the lock in `dir`, writing the current PID into it.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        Self::acquire_with(dir, |file| {
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()
        })
    }

    fn acquire_with(
        dir: &Path,
        write_owner: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Removed on drop if the owner cannot be recorded.
                let lock = Self {
                    path,
                    released: false,
                };
                write_owner(&mut file)?;
                log::debug!("Acquired storage lock {}", lock.path.display());
                Ok(lock)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let pid = read_pid(&path)?;
                if pid_is_alive(pid) {
                    Err(LockError::Held { pid, path })
                } else {
                    Err(LockError::Stale { pid, path })
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(&self.path)?;
        log::debug!("Released storage lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_pid(path: &Path) -> Result<u32, LockError> {
    let contents = fs::read_to_string(path)?;
    contents.trim().parse().map_err(|e| LockError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("{e}"),
    })
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    // No cheap liveness check; treat the owner as running.
    true
}
