//! Fakes standing in for Discord, the CDN, the pipeline and the bot process

#![allow(dead_code)]

use async_trait::async_trait;
use kvk_ingest::config::RuntimePaths;
use kvk_ingest::models::exit::{RestartFlag, RESTART_EXIT_CODE};
use kvk_ingest::models::job::Job;
use kvk_ingest::models::pipeline::PipelineResult;
use kvk_ingest::services::exit_protocol::{write_pid_file, ExitProtocol, FileExitProtocol};
use kvk_ingest::services::pipeline::JobProcessor;
use kvk_ingest::services::storage::{AttachmentFetcher, StorageError};
use kvk_ingest::services::watchdog::{ChildLauncher, SupervisedChild};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Serves fixed bytes, or fails every request.
pub struct FakeFetcher {
    pub fail: bool,
    pub requests: AtomicUsize,
}

impl FakeFetcher {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AttachmentFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StorageError::Status(503));
        }
        Ok(format!("payload from {url}").into_bytes())
    }
}

/// Records every job and the highest number of jobs running at once.
#[derive(Default)]
pub struct TrackingProcessor {
    pub delay: Duration,
    pub panic_on: Option<String>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    processed: Mutex<Vec<(u64, String)>>,
}

impl TrackingProcessor {
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn panicking_on(filename: &str) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(filename.to_string()),
            ..Self::default()
        })
    }

    pub fn processed(&self) -> Vec<(u64, String)> {
        self.processed.lock().unwrap().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobProcessor for TrackingProcessor {
    async fn process(&self, job: &Job) -> PipelineResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        assert!(job.save_path.exists(), "job handed over before download finished");

        tokio::time::sleep(self.delay).await;
        self.processed
            .lock()
            .unwrap()
            .push((job.channel_id, job.filename.clone()));
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on.as_deref() == Some(job.filename.as_str()) {
            panic!("processor exploded on {}", job.filename);
        }
        PipelineResult {
            success_excel: true,
            success_archive: true,
            success_sql: true,
            success_export: true,
            success_proc_import: Some(true),
            combined_log: String::new(),
        }
    }
}

/// How one scripted bot run ends.
#[derive(Debug, Clone, Copy)]
pub enum ChildScript {
    /// Exit with this status after running for the given time
    Crash(i32, Duration),
    /// `!restart`: flag, exit-code file, exit 15
    PlannedRestart,
    /// Exit 15 without writing the restart flag
    RestartWithoutFlag,
    /// Flag and exit-code file say 15, but the process status is 1
    RestartWithStatusOne,
    /// Another process takes over the PID file, then `!shutdown`
    HandOverPid(u32),
    /// `!shutdown`: marker then exit 0
    Shutdown,
    /// Run until terminated by the watchdog
    RunForever,
}

/// Hands out scripted children in order; once the script is exhausted every
/// child asks for shutdown.
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<ChildScript>>,
    protocol: FileExitProtocol,
    pid_file: PathBuf,
    pub launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(paths: &RuntimePaths, scripts: Vec<ChildScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            protocol: FileExitProtocol::new(paths),
            pid_file: paths.bot_pid_file.clone(),
            launches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChildLauncher for ScriptedLauncher {
    async fn launch(&self) -> std::io::Result<Box<dyn SupervisedChild>> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ChildScript::Shutdown);
        Ok(Box::new(ScriptedChild {
            pid: 40_000 + n as u32,
            script,
            protocol: self.protocol.clone(),
            pid_file: self.pid_file.clone(),
            terminated: Arc::new(Notify::new()),
        }))
    }
}

struct ScriptedChild {
    pid: u32,
    script: ChildScript,
    protocol: FileExitProtocol,
    pid_file: PathBuf,
    terminated: Arc<Notify>,
}

#[async_trait]
impl SupervisedChild for ScriptedChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.script {
            ChildScript::Crash(code, run) => {
                tokio::time::sleep(run).await;
                Ok(Some(code))
            }
            ChildScript::PlannedRestart => {
                self.protocol
                    .write_restart_flag(&RestartFlag::new(77, "deploy"))
                    .unwrap();
                self.protocol.write_exit_code(RESTART_EXIT_CODE).unwrap();
                Ok(Some(RESTART_EXIT_CODE))
            }
            ChildScript::RestartWithoutFlag => Ok(Some(RESTART_EXIT_CODE)),
            ChildScript::RestartWithStatusOne => {
                self.protocol
                    .write_restart_flag(&RestartFlag::new(77, "config reload"))
                    .unwrap();
                self.protocol.write_exit_code(RESTART_EXIT_CODE).unwrap();
                Ok(Some(1))
            }
            ChildScript::HandOverPid(other) => {
                write_pid_file(&self.pid_file, other).unwrap();
                self.protocol.write_shutdown_marker("handover").unwrap();
                self.protocol.write_exit_code(0).unwrap();
                Ok(Some(0))
            }
            ChildScript::Shutdown => {
                self.protocol.write_shutdown_marker("maintenance").unwrap();
                self.protocol.write_exit_code(0).unwrap();
                Ok(Some(0))
            }
            ChildScript::RunForever => {
                self.terminated.notified().await;
                Ok(None)
            }
        }
    }

    fn terminate(&mut self) {
        self.terminated.notify_one();
    }
}
