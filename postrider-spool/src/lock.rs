//! Queue file locking.
//!
//! The strategy is chosen at open time: kernel advisory locks for regular
//! filesystems, dotlock files where only filesystem primitives can be
//! trusted, both for the paranoid, or none for read-only inspection.

use std::{
    fs::File,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use crate::SpoolError;

/// How a queue file is protected against concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    /// `flock(2)` on the open descriptor.
    #[default]
    Kernel,
    /// An exclusively-created `<name>.lock` file next to the queue file.
    Dotlock,
    /// Kernel lock and dotlock together.
    Both,
    /// No locking; read-only observers.
    None,
}

/// A held lock; released on drop.
#[derive(Debug)]
pub struct QueueFileGuard {
    fd_locked: Option<i32>,
    dotlock: Option<PathBuf>,
}

impl LockStrategy {
    /// Acquire this lock on an open queue file without blocking.
    ///
    /// Returns [`SpoolError::Locked`] when another process holds it.
    pub fn acquire(self, file: &File, path: &Path) -> Result<QueueFileGuard, SpoolError> {
        let mut guard = QueueFileGuard {
            fd_locked: None,
            dotlock: None,
        };
        if matches!(self, Self::Kernel | Self::Both) {
            flock_exclusive(file)?;
            guard.fd_locked = Some(file.as_raw_fd());
        }
        if matches!(self, Self::Dotlock | Self::Both) {
            let lock_path = dotlock_path(path);
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => guard.dotlock = Some(lock_path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(SpoolError::Locked);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(guard)
    }

    /// Whether another process currently holds a lock on the file.
    pub fn is_locked_by_other(self, file: &File, path: &Path) -> Result<bool, SpoolError> {
        match self {
            Self::None => Ok(false),
            Self::Dotlock => Ok(dotlock_path(path).exists()),
            Self::Kernel | Self::Both => match flock_exclusive(file) {
                Ok(()) => {
                    flock_unlock(file);
                    Ok(false)
                }
                Err(SpoolError::Locked) => Ok(true),
                Err(e) => Err(e),
            },
        }
    }
}

fn dotlock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn flock_exclusive(file: &File) -> Result<(), SpoolError> {
    // Non-blocking: contention surfaces as Locked, not as a stall.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(SpoolError::Locked);
    }
    Err(err.into())
}

fn flock_unlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

impl Drop for QueueFileGuard {
    fn drop(&mut self) {
        if let Some(fd) = self.fd_locked {
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }
        if let Some(path) = &self.dotlock {
            let _ = std::fs::remove_file(path);
        }
    }
}
