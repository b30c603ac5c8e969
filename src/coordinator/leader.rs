//! Single-leader election over an advisory file lock.
//!
//! Only the process holding the lock runs triggers, sweeps and the worker
//! pool. The lock file stores the holder's pid so contenders can report it
//! and reclaim a lock left behind by a dead holder.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::dispatch::process::is_pid_alive;
use crate::error::CoordinatorError;

/// Held leadership. Released when dropped.
#[derive(Debug)]
pub struct LeaderLock {
    file: File,
    path: PathBuf,
}

impl LeaderLock {
    /// Takes the lock without blocking.
    ///
    /// Fails with [`CoordinatorError::NotLeader`] carrying the holder's pid
    /// when another live process holds it.
    pub fn try_acquire(path: &Path) -> Result<Self, CoordinatorError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::try_lock(path)? {
            Ok(lock) => Ok(lock),
            Err(holder) if holder > 0 && !is_pid_alive(holder as u32) => {
                warn!(
                    path = %path.display(),
                    stale_pid = holder,
                    "Reclaiming leader lock from dead process"
                );
                std::fs::remove_file(path)?;
                Self::try_lock(path)?.map_err(CoordinatorError::NotLeader)
            }
            Err(holder) => Err(CoordinatorError::NotLeader(holder)),
        }
    }

    /// Inner result is the holder pid on contention, 0 when unreadable.
    fn try_lock(path: &Path) -> Result<Result<Self, i32>, CoordinatorError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(err.into());
            }
            return Ok(Err(read_pid(&mut file)));
        }

        let pid = std::process::id();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;

        info!(path = %path.display(), pid, "Acquired leader lock");
        Ok(Ok(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn read_pid(file: &mut File) -> i32 {
    let mut contents = String::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut contents).is_err() {
        return 0;
    }
    contents.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader.lock");

        let lock = LeaderLock::try_acquire(&path).unwrap();
        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored.trim(), std::process::id().to_string());

        match LeaderLock::try_acquire(&path) {
            Err(CoordinatorError::NotLeader(pid)) => {
                assert_eq!(pid, std::process::id() as i32)
            }
            other => panic!("expected NotLeader, got {:?}", other.map(|_| ())),
        }

        drop(lock);
        assert!(LeaderLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn test_stale_pid_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("leader.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "999999999\n").unwrap();

        let lock = LeaderLock::try_acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored.trim(), std::process::id().to_string());
    }
}
