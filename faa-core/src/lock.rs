//! Single-writer advisory file locks with stale-holder reclamation.
//!
//! A lock file holds the decimal PID of its holder and an exclusive
//! advisory `flock(2)` on the open descriptor. When acquisition contends,
//! the PID in the file is probed with signal 0; a dead holder's file is
//! removed and acquisition retried once, so a hard crash never requires
//! manually deleting lock files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock is held by another process")]
    Busy,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An acquired advisory lock. The lock is released when the handle is
/// dropped; [`Lock::release`] consumes the handle for explicit release, so
/// a double release is unrepresentable.
pub struct Lock {
    flock: Flock<File>,
    path: PathBuf,
}

impl Lock {
    /// Open-or-create `path` and take a non-blocking exclusive lock on it.
    ///
    /// On contention the file's PID content is probed; a stale holder is
    /// reclaimed by removing the file and retrying once. A live holder
    /// yields [`LockError::Busy`]. On success the caller's PID is written
    /// to the file, truncating prior contents.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match Self::try_flock(path)? {
            Some(lock) => Ok(lock),
            None => {
                if !is_lock_stale(path) {
                    return Err(LockError::Busy);
                }
                // Holder is dead; reclaim and retry once.
                let _ = std::fs::remove_file(path);
                match Self::try_flock(path)? {
                    Some(lock) => Ok(lock),
                    None => Err(LockError::Busy),
                }
            }
        }
    }

    fn try_flock(path: &Path) -> Result<Option<Self>, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o666)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                let lock = Self {
                    flock,
                    path: path.to_path_buf(),
                };
                lock.write_pid()?;
                Ok(Some(lock))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => Ok(None),
            Err((_, errno)) => Err(LockError::Io(std::io::Error::from(errno))),
        }
    }

    fn write_pid(&self) -> std::io::Result<()> {
        let file: &File = &self.flock;
        file.set_len(0)?;
        let mut file = file;
        write!(file, "{}", std::process::id())?;
        file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and close. Dropping the handle has the same effect.
    pub fn release(self) -> Result<(), LockError> {
        self.flock
            .unlock()
            .map(|_| ())
            .map_err(|(_, errno)| LockError::Io(std::io::Error::from(errno)))
    }
}

/// Whether the lock file at `path` belongs to a holder that no longer
/// exists. Unreadable or unparseable content is treated as live; only a
/// parseable PID that fails the signal-0 probe (or is not positive) counts
/// as stale.
fn is_lock_stale(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return true;
    }
    kill(Pid::from_raw(pid), None).is_err()
}
