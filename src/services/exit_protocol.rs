use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RuntimePaths;
use crate::models::exit::RestartFlag;
use crate::services::storage::{write_atomic, write_json_atomic, StorageError};

const EXIT_CODE_ATTEMPTS: u32 = 5;
const EXIT_CODE_RETRY_DELAY: Duration = Duration::from_secs(1);
const RESTART_FLAG_POLL: Duration = Duration::from_millis(200);

/// Durable handshake between the bot and its watchdog, surviving a full
/// process restart.
#[async_trait]
pub trait ExitProtocol: Send + Sync {
    fn write_exit_code(&self, code: i32) -> Result<(), ExitProtocolError>;

    /// Read and delete the exit-code override, retrying while the file is locked.
    async fn consume_exit_code(&self) -> Option<i32>;

    fn write_restart_flag(&self, flag: &RestartFlag) -> Result<(), ExitProtocolError>;

    /// Poll for the restart flag for up to `grace`.
    async fn wait_for_restart_flag(&self, grace: Duration) -> bool;

    /// Read and delete the restart flag. Unreadable fields become "unknown".
    fn take_restart_flag(&self) -> RestartFlag;

    fn write_shutdown_marker(&self, reason: &str) -> Result<(), ExitProtocolError>;

    fn has_shutdown_marker(&self) -> bool;

    /// Read and delete the shutdown marker when present.
    fn take_shutdown_marker(&self) -> Option<String>;
}

/// File-backed protocol rooted in the data directory.
#[derive(Debug, Clone)]
pub struct FileExitProtocol {
    exit_code_file: PathBuf,
    restart_flag_file: PathBuf,
    shutdown_marker_file: PathBuf,
}

impl FileExitProtocol {
    pub fn new(paths: &RuntimePaths) -> Self {
        Self {
            exit_code_file: paths.exit_code_file.clone(),
            restart_flag_file: paths.restart_flag_file.clone(),
            shutdown_marker_file: paths.shutdown_marker_file.clone(),
        }
    }
}

#[async_trait]
impl ExitProtocol for FileExitProtocol {
    fn write_exit_code(&self, code: i32) -> Result<(), ExitProtocolError> {
        write_atomic(&self.exit_code_file, code.to_string().as_bytes())?;
        Ok(())
    }

    async fn consume_exit_code(&self) -> Option<i32> {
        for attempt in 1..=EXIT_CODE_ATTEMPTS {
            match std::fs::read_to_string(&self.exit_code_file) {
                Ok(raw) => {
                    let raw = raw.trim();
                    let code = match raw.parse::<i32>() {
                        Ok(code) => Some(code),
                        Err(_) if raw.is_empty() => None,
                        Err(e) => {
                            tracing::warn!(raw, error = %e, "Invalid exit code file");
                            None
                        }
                    };
                    safe_remove(&self.exit_code_file);
                    if let Some(code) = code {
                        tracing::info!(code, "Exit code override read from file");
                    }
                    return code;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return None,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    tracing::info!(attempt, "Exit code file locked, retrying");
                    tokio::time::sleep(EXIT_CODE_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read exit code file");
                    return None;
                }
            }
        }
        None
    }

    fn write_restart_flag(&self, flag: &RestartFlag) -> Result<(), ExitProtocolError> {
        write_json_atomic(&self.restart_flag_file, flag)?;
        Ok(())
    }

    async fn wait_for_restart_flag(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.restart_flag_file.exists() {
                tracing::info!("Restart flag detected");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!(grace_secs = grace.as_secs_f64(), "Restart flag not detected");
                return false;
            }
            tokio::time::sleep(RESTART_FLAG_POLL).await;
        }
    }

    fn take_restart_flag(&self) -> RestartFlag {
        let flag = std::fs::read(&self.restart_flag_file)
            .map_err(ExitProtocolError::from)
            .and_then(|body| serde_json::from_slice(&body).map_err(ExitProtocolError::from))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read restart flag metadata");
                RestartFlag::unknown()
            });
        safe_remove(&self.restart_flag_file);
        flag
    }

    fn write_shutdown_marker(&self, reason: &str) -> Result<(), ExitProtocolError> {
        write_atomic(&self.shutdown_marker_file, reason.as_bytes())?;
        Ok(())
    }

    fn has_shutdown_marker(&self) -> bool {
        self.shutdown_marker_file.exists()
    }

    fn take_shutdown_marker(&self) -> Option<String> {
        if !self.has_shutdown_marker() {
            return None;
        }
        let reason = std::fs::read_to_string(&self.shutdown_marker_file)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read shutdown marker");
                String::new()
            });
        safe_remove(&self.shutdown_marker_file);
        Some(reason)
    }
}

/// Remove a file, logging anything other than "not found".
pub fn safe_remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Publish a child PID for external tooling.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), ExitProtocolError> {
    write_atomic(path, pid.to_string().as_bytes())?;
    Ok(())
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Remove the PID file only when it still names `pid`.
pub fn remove_pid_file_if_owned(path: &Path, pid: u32) {
    if read_pid_file(path) == Some(pid) {
        safe_remove(path);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExitProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> (tempfile::TempDir, FileExitProtocol, RuntimePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        (dir, FileExitProtocol::new(&paths), paths)
    }

    #[tokio::test]
    async fn test_exit_code_consumed_once() {
        let (_dir, protocol, paths) = protocol();
        protocol.write_exit_code(15).unwrap();
        assert_eq!(protocol.consume_exit_code().await, Some(15));
        assert!(!paths.exit_code_file.exists());
        assert_eq!(protocol.consume_exit_code().await, None);
    }

    #[tokio::test]
    async fn test_blank_exit_code_is_none() {
        let (_dir, protocol, paths) = protocol();
        std::fs::write(&paths.exit_code_file, "  \n").unwrap();
        assert_eq!(protocol.consume_exit_code().await, None);
        assert!(!paths.exit_code_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_flag_roundtrip() {
        let (_dir, protocol, paths) = protocol();
        assert!(!protocol.wait_for_restart_flag(Duration::from_secs(1)).await);

        protocol
            .write_restart_flag(&RestartFlag::new(42, "deploy"))
            .unwrap();
        assert!(protocol.wait_for_restart_flag(Duration::from_secs(5)).await);
        let flag = protocol.take_restart_flag();
        assert_eq!(flag.reason, "deploy");
        assert_eq!(flag.user_label(), "42");
        assert!(!paths.restart_flag_file.exists());
    }

    #[test]
    fn test_garbled_restart_flag_reads_unknown() {
        let (_dir, protocol, paths) = protocol();
        std::fs::write(&paths.restart_flag_file, "garbage").unwrap();
        assert_eq!(protocol.take_restart_flag(), RestartFlag::unknown());

        std::fs::write(&paths.restart_flag_file, r#"{"reason": "manual"}"#).unwrap();
        let flag = protocol.take_restart_flag();
        assert_eq!(flag.reason, "manual");
        assert_eq!(flag.user_label(), "unknown");
    }

    #[test]
    fn test_shutdown_marker() {
        let (_dir, protocol, _paths) = protocol();
        assert_eq!(protocol.take_shutdown_marker(), None);
        protocol.write_shutdown_marker("maintenance window\n").unwrap();
        assert!(protocol.has_shutdown_marker());
        assert_eq!(
            protocol.take_shutdown_marker().as_deref(),
            Some("maintenance window")
        );
        assert!(!protocol.has_shutdown_marker());
    }

    #[test]
    fn test_pid_file_owned_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_pid.txt");
        write_pid_file(&path, 100).unwrap();
        remove_pid_file_if_owned(&path, 200);
        assert_eq!(read_pid_file(&path), Some(100));
        remove_pid_file_if_owned(&path, 100);
        assert!(!path.exists());
    }
}
