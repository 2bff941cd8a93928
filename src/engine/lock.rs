//! Per-cluster advisory lock
//!
//! Two lifecycle operations on the same cluster must never run
//! concurrently. The lock is a file created with `O_EXCL` under the
//! cluster data dir, holding the owner's pid; contention is detected at
//! open time, so a second caller gets `Busy` immediately. A lock whose
//! recorded pid no longer exists is stale (a crashed controller) and is
//! broken once.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Held for the duration of one lifecycle operation; released on drop
#[derive(Debug)]
pub struct ClusterLock {
    path: PathBuf,
}

impl ClusterLock {
    /// Acquire the lock or fail with [`Error::Busy`]
    pub fn acquire(path: PathBuf, cluster: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io("creating cluster data dir", e))?;
        }

        let mut broke_stale = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    debug!(path = %path.display(), "cluster lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if !broke_stale && is_stale(&holder) {
                        warn!(path = %path.display(), holder, "breaking stale cluster lock");
                        let _ = std::fs::remove_file(&path);
                        broke_stale = true;
                        continue;
                    }
                    return Err(Error::Busy {
                        cluster: cluster.to_string(),
                        holder: if holder.is_empty() {
                            "unknown".to_string()
                        } else {
                            holder
                        },
                    });
                }
                Err(e) => return Err(Error::io("acquiring cluster lock", e)),
            }
        }
    }
}

/// A lock is stale when its recorded pid is no longer alive
fn is_stale(holder: &str) -> bool {
    match holder.parse::<u32>() {
        Ok(pid) => !Path::new(&format!("/proc/{pid}")).exists(),
        Err(_) => false,
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            // Reset may have removed the whole cluster dir already
            debug!(path = %self.path.display(), error = %e, "lock file already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo").join("cluster.lock");

        let lock = ClusterLock::acquire(path.clone(), "demo").unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo").join("cluster.lock");

        let _lock = ClusterLock::acquire(path.clone(), "demo").unwrap();
        let err = ClusterLock::acquire(path, "demo").unwrap_err();
        assert_eq!(err.kind(), "E_BUSY");
        assert!(err.to_string().contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo").join("cluster.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Pid u32::MAX is far above any real pid_max
        std::fs::write(&path, u32::MAX.to_string()).unwrap();

        let lock = ClusterLock::acquire(path.clone(), "demo").unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_unparsable_holder_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo").join("cluster.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        let err = ClusterLock::acquire(path, "demo").unwrap_err();
        assert_eq!(err.kind(), "E_BUSY");
    }
}
