use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::offload::{OffloadMode, OffloadRegistryEntry, OffloadStatus};
use crate::services::storage::{write_json_atomic, StorageError};
use crate::telemetry::{emit_telemetry_event, snippet, MAX_SNIPPET};

pub type Registry = BTreeMap<String, OffloadRegistryEntry>;

/// On-disk registry of offloads keyed by `offload_id`. Every mutation is a
/// locked read-modify-write with an atomic overwrite.
#[derive(Debug)]
pub struct OffloadRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OffloadRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries. A missing or unreadable file reads as empty;
    /// malformed entries are skipped.
    pub fn load(&self) -> Registry {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        read_registry(&self.path)
    }

    pub fn entries(&self) -> Vec<OffloadRegistryEntry> {
        self.load().into_values().collect()
    }

    pub fn get(&self, offload_id: &str) -> Option<OffloadRegistryEntry> {
        self.load().remove(offload_id)
    }

    /// Apply `f` to the whole registry and persist the result.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> Result<R, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut registry = read_registry(&self.path);
        let result = f(&mut registry);
        write_json_atomic(&self.path, &registry)?;
        Ok(result)
    }

    pub fn register(&self, entry: OffloadRegistryEntry) -> Result<(), RegistryError> {
        self.mutate(|registry| {
            registry.insert(entry.offload_id.clone(), entry);
        })
    }

    /// Update one entry; `Ok(false)` when it is not registered.
    pub fn update(
        &self,
        offload_id: &str,
        f: impl FnOnce(&mut OffloadRegistryEntry),
    ) -> Result<bool, RegistryError> {
        self.mutate(|registry| match registry.get_mut(offload_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        })
    }

    pub fn mark_complete(
        &self,
        offload_id: &str,
        ok: bool,
        output: &str,
    ) -> Result<bool, RegistryError> {
        self.update(offload_id, |entry| {
            entry.status = OffloadStatus::Completed;
            entry.end_time = Some(Utc::now());
            entry.ok = Some(ok);
            entry.output_snippet = Some(snippet(output, MAX_SNIPPET));
        })
    }
}

fn read_registry(path: &Path) -> Registry {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Registry::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read offload registry");
            return Registry::new();
        }
    };
    let raw: BTreeMap<String, Value> = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Offload registry is not a JSON object");
            return Registry::new();
        }
    };
    raw.into_iter()
        .filter_map(|(id, value)| match serde_json::from_value(value) {
            Ok(entry) => Some((id, entry)),
            Err(e) => {
                tracing::warn!(offload_id = %id, error = %e, "Skipping malformed offload entry");
                None
            }
        })
        .collect()
}

/// An external command run in maintenance isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Whitespace-split command line; `None` when blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            env: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub type BlockingWork = Box<dyn FnOnce() -> Result<String, String> + Send + 'static>;

/// What to run and where.
pub enum OffloadWork {
    Thread(BlockingWork),
    Process(CommandSpec),
}

/// Result of one offload.
#[derive(Debug, Clone, PartialEq)]
pub struct OffloadOutcome {
    pub offload_id: String,
    pub ok: bool,
    /// Return text of thread work, or stdout of a process
    pub output: String,
    pub stderr: String,
    pub pid: Option<u32>,
    pub timed_out: bool,
}

/// Runs blocking work off the async runtime with a timeout and a registry entry.
#[derive(Clone)]
pub struct OffloadRunner {
    registry: Arc<OffloadRegistry>,
}

impl OffloadRunner {
    pub fn new(registry: Arc<OffloadRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<OffloadRegistry> {
        &self.registry
    }

    /// Run `work` on a worker thread or in a child process.
    pub async fn run(
        &self,
        name: &str,
        work: OffloadWork,
        timeout: Duration,
        meta: BTreeMap<String, Value>,
    ) -> OffloadOutcome {
        match work {
            OffloadWork::Thread(f) => self.run_in_thread(name, timeout, meta, f).await,
            OffloadWork::Process(command) => self.run_in_process(name, &command, timeout, meta).await,
        }
    }

    /// Thread offload. A timeout returns control to the caller but cannot stop
    /// the thread; its registry entry completes whenever the work does.
    pub async fn run_in_thread<F>(
        &self,
        name: &str,
        timeout: Duration,
        meta: BTreeMap<String, Value>,
        work: F,
    ) -> OffloadOutcome
    where
        F: FnOnce() -> Result<String, String> + Send + 'static,
    {
        let entry = OffloadRegistryEntry::started(
            name,
            OffloadMode::Thread,
            Some(std::process::id()),
            meta,
        );
        let offload_id = entry.offload_id.clone();
        let pid = entry.pid;
        self.register(entry);

        let registry = self.registry.clone();
        let id = offload_id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let (ok, output) = match std::panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(output)) => (true, output),
                Ok(Err(output)) => (false, output),
                Err(_) => (false, "offload worker panicked".to_string()),
            };
            if let Err(e) = registry.mark_complete(&id, ok, &output) {
                tracing::warn!(offload_id = %id, error = %e, "Failed to mark offload complete");
            }
            (ok, output)
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok((ok, output))) => OffloadOutcome {
                offload_id,
                ok,
                output,
                stderr: String::new(),
                pid,
                timed_out: false,
            },
            Ok(Err(e)) => OffloadOutcome {
                offload_id,
                ok: false,
                output: format!("offload task failed: {e}"),
                stderr: String::new(),
                pid,
                timed_out: false,
            },
            Err(_) => {
                let output = format!("{name} timed out after {}s", timeout.as_secs());
                self.flag_timeout(&offload_id, OffloadMode::Thread, pid, name, timeout);
                OffloadOutcome {
                    offload_id,
                    ok: false,
                    output,
                    stderr: String::new(),
                    pid,
                    timed_out: true,
                }
            }
        }
    }

    /// Process offload. A timeout kills the child.
    pub async fn run_in_process(
        &self,
        name: &str,
        command: &CommandSpec,
        timeout: Duration,
        meta: BTreeMap<String, Value>,
    ) -> OffloadOutcome {
        let spawned = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(offload = name, program = %command.program, error = %e, "Failed to spawn offload");
                return OffloadOutcome {
                    offload_id: String::new(),
                    ok: false,
                    output: format!("failed to start {}: {e}", command.program),
                    stderr: String::new(),
                    pid: None,
                    timed_out: false,
                };
            }
        };

        let pid = child.id();
        let entry = OffloadRegistryEntry::started(name, OffloadMode::Process, pid, meta);
        let offload_id = entry.offload_id.clone();
        self.register(entry);
        tracing::info!(offload = name, offload_id = %offload_id, pid = ?pid, "Offload process started");

        // Dropping the wait future on timeout drops the child, which kills it.
        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let (ok, stdout, stderr, timed_out) = match waited {
            Ok(Ok(output)) => (
                output.status.success(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
                false,
            ),
            Ok(Err(e)) => (false, format!("failed to collect output: {e}"), String::new(), false),
            Err(_) => (
                false,
                format!("{name} timed out after {}s; process killed", timeout.as_secs()),
                String::new(),
                true,
            ),
        };

        if timed_out {
            self.flag_timeout(&offload_id, OffloadMode::Process, pid, name, timeout);
        }
        let combined = if stderr.is_empty() {
            stdout.clone()
        } else {
            format!("{stdout}\n{stderr}")
        };
        if let Err(e) = self.registry.mark_complete(&offload_id, ok, &combined) {
            tracing::warn!(offload_id = %offload_id, error = %e, "Failed to mark offload complete");
        }

        OffloadOutcome {
            offload_id,
            ok,
            output: stdout,
            stderr,
            pid,
            timed_out,
        }
    }

    fn register(&self, entry: OffloadRegistryEntry) {
        let id = entry.offload_id.clone();
        if let Err(e) = self.registry.register(entry) {
            tracing::warn!(offload_id = %id, error = %e, "Failed to register offload");
        }
    }

    fn flag_timeout(
        &self,
        offload_id: &str,
        mode: OffloadMode,
        pid: Option<u32>,
        name: &str,
        timeout: Duration,
    ) {
        let orphaned = mode == OffloadMode::Thread;
        let updated = self.registry.update(offload_id, |entry| {
            entry.meta.insert("timed_out".to_string(), Value::Bool(true));
            if mode == OffloadMode::Process {
                entry.cancel_requested = true;
            }
        });
        if let Err(e) = updated {
            tracing::warn!(offload_id, error = %e, "Failed to flag offload timeout");
        }
        tracing::warn!(
            offload = name,
            offload_id,
            pid = ?pid,
            mode = %mode,
            timeout_secs = timeout.as_secs(),
            orphaned_offload_possible = orphaned,
            "Offload timed out"
        );
        metrics::counter!("offload_timeouts_total", "mode" => mode.to_string()).increment(1);
        emit_telemetry_event(
            "offload.timeout",
            json!({
                "name": name,
                "offload_id": offload_id,
                "pid": pid,
                "mode": mode.to_string(),
                "timeout_secs": timeout.as_secs(),
                "orphaned_offload_possible": orphaned,
            }),
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to persist offload registry: {0}")]
    Persist(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> (tempfile::TempDir, OffloadRunner) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(OffloadRegistry::new(dir.path().join("offload_registry.json")));
        (dir, OffloadRunner::new(registry))
    }

    #[tokio::test]
    async fn test_thread_offload_completes_entry() {
        let (_dir, runner) = runner();
        let work = OffloadWork::Thread(Box::new(|| Ok::<_, String>("built 12 entries".to_string())));
        let outcome = runner
            .run("cache", work, Duration::from_secs(5), BTreeMap::new())
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.output, "built 12 entries");

        let entry = runner.registry().get(&outcome.offload_id).unwrap();
        assert_eq!(entry.status, OffloadStatus::Completed);
        assert_eq!(entry.ok, Some(true));
        assert_eq!(entry.pid, Some(std::process::id()));
        assert!(entry.end_time.is_some());
    }

    #[tokio::test]
    async fn test_thread_offload_error_and_panic() {
        let (_dir, runner) = runner();
        let failed = runner
            .run_in_thread("x", Duration::from_secs(5), BTreeMap::new(), || {
                Err("bad input".to_string())
            })
            .await;
        assert!(!failed.ok);
        assert_eq!(failed.output, "bad input");

        let panicked = runner
            .run_in_thread("y", Duration::from_secs(5), BTreeMap::new(), || {
                panic!("boom")
            })
            .await;
        assert!(!panicked.ok);
        let entry = runner.registry().get(&panicked.offload_id).unwrap();
        assert!(entry.is_completed());
    }

    #[tokio::test]
    async fn test_thread_timeout_leaves_running_entry() {
        let (_dir, runner) = runner();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let outcome = runner
            .run_in_thread("slow", Duration::from_millis(50), BTreeMap::new(), move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok("late".to_string())
            })
            .await;
        assert!(outcome.timed_out);
        assert!(!outcome.ok);
        assert!(outcome.output.contains("timed out"));

        let entry = runner.registry().get(&outcome.offload_id).unwrap();
        assert_eq!(entry.status, OffloadStatus::Running);
        assert!(entry.timed_out());

        release_tx.send(()).unwrap();
        for _ in 0..100 {
            if runner.registry().get(&outcome.offload_id).unwrap().is_completed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("orphaned thread never completed its entry");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_offload_captures_stdout() {
        let (_dir, runner) = runner();
        let command = CommandSpec::new("sh").arg("-c").arg("echo '{\"success\": true}'");
        let outcome = runner
            .run_in_process("export", &command, Duration::from_secs(10), BTreeMap::new())
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.output.trim(), r#"{"success": true}"#);
        assert!(outcome.pid.is_some());
        let entry = runner.registry().get(&outcome.offload_id).unwrap();
        assert_eq!(entry.mode, OffloadMode::Process);
        assert!(entry.is_completed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_offload_killed_on_timeout() {
        let (_dir, runner) = runner();
        let command = CommandSpec::new("sleep").arg("30");
        let outcome = runner
            .run_in_process("sql_proc", &command, Duration::from_millis(200), BTreeMap::new())
            .await;
        assert!(outcome.timed_out);
        let entry = runner.registry().get(&outcome.offload_id).unwrap();
        assert!(entry.is_completed());
        assert!(entry.cancel_requested);
        assert_eq!(entry.ok, Some(false));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        let (_dir, runner) = runner();
        let outcome = runner
            .run_in_process(
                "missing",
                &CommandSpec::new("/nonexistent/kvk-tool"),
                Duration::from_secs(1),
                BTreeMap::new(),
            )
            .await;
        assert!(!outcome.ok);
        assert!(outcome.output.contains("failed to start"));
    }

    #[test]
    fn test_registry_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offload_registry.json");
        let good = OffloadRegistryEntry::started("a", OffloadMode::Thread, Some(1), BTreeMap::new());
        let mut body = serde_json::Map::new();
        body.insert(good.offload_id.clone(), serde_json::to_value(&good).unwrap());
        body.insert("broken".to_string(), json!({"status": "weird"}));
        std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        let registry = OffloadRegistry::new(&path);
        assert_eq!(registry.load().len(), 1);
    }

    #[test]
    fn test_command_parse() {
        let spec = CommandSpec::parse("  python  export.py --all ").unwrap();
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["export.py", "--all"]);
        assert!(CommandSpec::parse("   ").is_none());
    }
}
