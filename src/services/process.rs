use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};

/// Slack allowed when comparing a process start time to a lock's `created` stamp.
const CREATION_TOLERANCE_SECS: f64 = 1.0;

/// Snapshot of an OS process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub running: bool,
    pub exe: Option<PathBuf>,
    /// Seconds since the Unix epoch
    pub started_at: Option<u64>,
}

fn refreshed(pid: u32) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::everything(),
    );
    system
}

/// Look up a process; `None` when it does not exist.
pub fn process_info(pid: u32) -> Option<ProcessInfo> {
    if pid == 0 {
        return None;
    }
    let system = refreshed(pid);
    let process = system.process(Pid::from_u32(pid))?;
    let running = !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead);
    let started_at = match process.start_time() {
        0 => None,
        t => Some(t),
    };
    Some(ProcessInfo {
        pid,
        running,
        exe: process.exe().map(Path::to_path_buf),
        started_at,
    })
}

pub fn pid_alive(pid: u32) -> bool {
    process_info(pid).is_some_and(|info| info.running)
}

fn same_path(a: &Path, b: &Path) -> bool {
    let a = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    a == b
}

/// Whether `pid` is alive and is plausibly the process that recorded `exe`
/// and `created_before`. Missing exe or start time on either side counts as
/// a match.
pub fn matches_process(pid: u32, exe: Option<&Path>, created_before: Option<f64>) -> bool {
    let Some(info) = process_info(pid).filter(|info| info.running) else {
        return false;
    };
    if let (Some(expected), Some(actual)) = (exe, info.exe.as_deref()) {
        if !same_path(expected, actual) {
            return false;
        }
    }
    if let (Some(created), Some(started)) = (created_before, info.started_at) {
        if started as f64 > created + CREATION_TOLERANCE_SECS {
            return false;
        }
    }
    true
}

/// Ask a process to terminate (SIGTERM where supported, hard kill otherwise).
pub fn terminate(pid: u32) -> bool {
    let system = refreshed(pid);
    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return false;
    };
    process
        .kill_with(Signal::Term)
        .unwrap_or_else(|| process.kill())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let pid = std::process::id();
        assert!(pid_alive(pid));
        let info = process_info(pid).unwrap();
        assert!(info.running);
    }

    #[test]
    fn test_missing_pid() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX - 1));
        assert!(!matches_process(u32::MAX - 1, None, None));
    }

    #[test]
    fn test_matches_current_exe() {
        let pid = std::process::id();
        let exe = std::env::current_exe().unwrap();
        let later = chrono::Utc::now().timestamp() as f64 + 60.0;
        assert!(matches_process(pid, Some(&exe), Some(later)));
        assert!(matches_process(pid, None, None));
    }

    #[test]
    fn test_rejects_other_exe_or_reused_pid() {
        let pid = std::process::id();
        assert!(!matches_process(
            pid,
            Some(Path::new("/definitely/not/this/binary")),
            None
        ));
        // Lock created long before this process started: pid was reused
        assert!(!matches_process(pid, None, Some(1_000.0)));
    }
}
