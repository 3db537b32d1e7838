use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::services::process;
use crate::services::storage::write_json_atomic;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Seconds since the Unix epoch
    pub created: f64,
    #[serde(default)]
    pub exe: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl LockRecord {
    pub fn current() -> Self {
        let now = chrono::Utc::now();
        Self {
            pid: std::process::id(),
            created: now.timestamp_micros() as f64 / 1_000_000.0,
            exe: std::env::current_exe()
                .ok()
                .map(|p| p.display().to_string()),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
        }
    }

    /// Whether the recorded holder is a live process that still owns this lock.
    pub fn is_held(&self) -> bool {
        if !process::pid_alive(self.pid) {
            return false;
        }
        match self.exe.as_deref() {
            None => true,
            Some(exe) => process::matches_process(self.pid, Some(Path::new(exe)), Some(self.created)),
        }
    }
}

/// File-based single-instance lock. Released on drop.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
    released: bool,
}

impl SingletonLock {
    /// Take the lock, clearing it first when the recorded holder is gone.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        if let Some(existing) = read_record(&path) {
            if existing.is_held() {
                return Err(LockError::Held {
                    path: path.display().to_string(),
                    pid: existing.pid,
                });
            }
            tracing::warn!(
                lock = %path.display(),
                stale_pid = existing.pid,
                "Removing stale lock"
            );
        }
        let _ = std::fs::remove_file(&path);

        let record = LockRecord::current();
        if let Err(e) = write_json_atomic(&path, &record) {
            tracing::error!(lock = %path.display(), error = %e, "Failed to write lock file");
        } else {
            tracing::info!(lock = %path.display(), pid = record.pid, "Lock acquired");
        }
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if !self.released {
            release(&self.path);
            self.released = true;
        }
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Corrupt or unreadable lock files read as absent.
pub fn read_record(path: &Path) -> Option<LockRecord> {
    let body = std::fs::read(path).ok()?;
    match serde_json::from_slice(&body) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(lock = %path.display(), error = %e, "Unreadable lock file treated as stale");
            None
        }
    }
}

/// Remove a lock file if present. Never fails.
pub fn release(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(lock = %path.display(), "Lock released"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(lock = %path.display(), error = %e, "Failed to remove lock"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock {path} is held by running pid {pid}")]
    Held { path: String, pid: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_own_record_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BOT_LOCK.json");
        {
            let lock = SingletonLock::acquire(&path).unwrap();
            let record = read_record(lock.path()).unwrap();
            assert_eq!(record.pid, std::process::id());
            assert!(record.exe.is_some());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BOT_LOCK.json");
        let stale = LockRecord {
            pid: u32::MAX - 1,
            created: 1.0,
            exe: Some("/usr/bin/python3".into()),
            cwd: None,
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = SingletonLock::acquire(&path).unwrap();
        assert_eq!(read_record(&path).unwrap().pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn test_corrupt_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BOT_LOCK.json");
        std::fs::write(&path, b"{not json").unwrap();
        let _lock = SingletonLock::acquire(&path).unwrap();
        assert_eq!(read_record(&path).unwrap().pid, std::process::id());
    }

    #[test]
    fn test_live_holder_conflicts_without_touching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WATCHDOG_LOCK.json");
        let holder = LockRecord {
            pid: std::process::id(),
            created: chrono::Utc::now().timestamp() as f64 + 60.0,
            exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
            cwd: Some("/elsewhere".into()),
        };
        let body = serde_json::to_vec(&holder).unwrap();
        std::fs::write(&path, &body).unwrap();

        let err = SingletonLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { pid, .. } if pid == std::process::id()));
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    #[test]
    fn test_reused_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BOT_LOCK.json");
        // Live pid, but the lock predates the process start
        let reused = LockRecord {
            pid: std::process::id(),
            created: 1_000.0,
            exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
            cwd: None,
        };
        std::fs::write(&path, serde_json::to_vec(&reused).unwrap()).unwrap();
        assert!(SingletonLock::acquire(&path).is_ok());
    }
}
