use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{RuntimePaths, WatchdogConfig};
use crate::models::exit::{ExitClassification, RestartFlag, RESTART_EXIT_CODE};
use crate::services::exit_protocol::{remove_pid_file_if_owned, write_pid_file, ExitProtocol};
use crate::services::storage::{append_csv_row, write_json_atomic};

const LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(5);
const RESTART_LOG_HEADER: [&str; 4] = ["timestamp", "reason", "actor", "status"];

/// A running bot process under supervision.
#[async_trait]
pub trait SupervisedChild: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit. `None` when the process was killed by a signal.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Request termination without waiting.
    fn terminate(&mut self);
}

#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch(&self) -> std::io::Result<Box<dyn SupervisedChild>>;
}

/// Launches the bot executable as an OS child process.
pub struct ProcessLauncher {
    program: PathBuf,
    cwd: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, cwd: PathBuf) -> Self {
        Self { program, cwd }
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(&self) -> std::io::Result<Box<dyn SupervisedChild>> {
        tracing::info!(program = %self.program.display(), "Launching bot");
        let child = tokio::process::Command::new(&self.program)
            .current_dir(&self.cwd)
            .env("WATCHDOG_RUN", "1")
            .env("WATCHDOG_PARENT_PID", std::process::id().to_string())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ProcessChild { child }))
    }
}

struct ProcessChild {
    child: tokio::process::Child,
}

#[async_trait]
impl SupervisedChild for ProcessChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    fn terminate(&mut self) {
        let signalled = self
            .child
            .id()
            .is_some_and(crate::services::process::terminate);
        if !signalled {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(error = %e, "Failed to terminate child");
            }
        }
    }
}

/// Restart timing and classification knobs.
#[derive(Debug, Clone)]
pub struct WatchdogPolicy {
    pub backoff_min: Duration,
    pub backoff_cap: Duration,
    pub healthy: Duration,
    pub crash_window: Duration,
    pub crash_threshold: usize,
    pub cooldown: Duration,
    pub restart_exit_code: i32,
    pub restart_flag_grace: Duration,
}

impl From<&WatchdogConfig> for WatchdogPolicy {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            backoff_min: Duration::from_secs(config.backoff_min_secs),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
            healthy: Duration::from_secs(config.healthy_secs),
            crash_window: Duration::from_secs(config.crash_window_secs),
            crash_threshold: config.crash_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            restart_exit_code: config.restart_exit_code,
            restart_flag_grace: Duration::from_secs(config.restart_flag_grace_secs),
        }
    }
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            healthy: Duration::from_secs(300),
            crash_window: Duration::from_secs(60),
            crash_threshold: 5,
            cooldown: Duration::from_secs(60),
            restart_exit_code: RESTART_EXIT_CODE,
            restart_flag_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogEvent {
    Launched { pid: Option<u32> },
    LaunchFailed,
    Exited {
        classification: ExitClassification,
        run: Duration,
    },
    /// `base` is the backoff step, `slept` includes jitter
    Backoff { base: Duration, slept: Duration },
    Cooldown { duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    ShutdownMarker,
    Graceful,
    ParentSignal,
}

/// What happened over one supervision session.
#[derive(Debug, Clone)]
pub struct SupervisionReport {
    pub events: Vec<WatchdogEvent>,
    pub stop: StopReason,
}

impl SupervisionReport {
    pub fn launches(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, WatchdogEvent::Launched { .. }))
            .count()
    }
}

/// Parent supervision loop: launch, classify each exit, relaunch with
/// backoff and crash-storm cooldown.
pub struct Watchdog {
    launcher: Arc<dyn ChildLauncher>,
    protocol: Arc<dyn ExitProtocol>,
    paths: RuntimePaths,
    policy: WatchdogPolicy,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub fn new(
        launcher: Arc<dyn ChildLauncher>,
        protocol: Arc<dyn ExitProtocol>,
        paths: RuntimePaths,
        policy: WatchdogPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            protocol,
            paths,
            policy,
            shutdown,
        }
    }

    pub async fn run(&self) -> SupervisionReport {
        let mut events = Vec::new();
        let mut backoff = self.policy.backoff_min;
        let mut crashes: VecDeque<Instant> = VecDeque::new();

        let stop = loop {
            if self.shutdown.is_cancelled() {
                break StopReason::ParentSignal;
            }

            let mut child = match self.launcher.launch().await {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to launch bot");
                    events.push(WatchdogEvent::LaunchFailed);
                    if !self.pause(LAUNCH_RETRY_DELAY).await {
                        break StopReason::ParentSignal;
                    }
                    continue;
                }
            };
            let pid = child.pid();
            if let Some(pid) = pid {
                match write_pid_file(&self.paths.bot_pid_file, pid) {
                    Ok(()) => tracing::info!(pid, "Child PID written"),
                    Err(e) => tracing::warn!(error = %e, "Failed to write PID file"),
                }
            }
            events.push(WatchdogEvent::Launched { pid });

            let started = Instant::now();
            let status = tokio::select! {
                status = child.wait() => status,
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Parent received termination signal, stopping child");
                    if let Err(e) = self.protocol.write_shutdown_marker("watchdog received termination signal") {
                        tracing::warn!(error = %e, "Failed to write shutdown marker");
                    }
                    child.terminate();
                    child.wait().await
                }
            };
            let run = started.elapsed();
            let raw_code = status.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to collect child exit status");
                None
            });
            tracing::info!(
                pid = ?pid,
                exit_code = ?raw_code,
                run_secs = run.as_secs_f64(),
                "Bot exited"
            );
            if let Some(pid) = pid {
                remove_pid_file_if_owned(&self.paths.bot_pid_file, pid);
            }

            let classification = self.classify(raw_code).await;
            self.record(&classification);
            events.push(WatchdogEvent::Exited {
                classification: classification.clone(),
                run,
            });

            match classification {
                ExitClassification::Shutdown { .. } => break StopReason::ShutdownMarker,
                ExitClassification::Graceful => break StopReason::Graceful,
                ExitClassification::PlannedRestart { .. } => {
                    backoff = self.policy.backoff_min;
                    events.push(WatchdogEvent::Backoff {
                        base: backoff,
                        slept: backoff,
                    });
                    if !self.pause(backoff).await {
                        break StopReason::ParentSignal;
                    }
                }
                ExitClassification::Crash { .. } => {
                    let now = Instant::now();
                    while crashes
                        .front()
                        .is_some_and(|t| now.duration_since(*t) > self.policy.crash_window)
                    {
                        crashes.pop_front();
                    }
                    crashes.push_back(now);

                    if crashes.len() >= self.policy.crash_threshold {
                        tracing::error!(
                            crashes = crashes.len(),
                            window_secs = self.policy.crash_window.as_secs(),
                            cooldown_secs = self.policy.cooldown.as_secs(),
                            "Crash storm detected, cooling down"
                        );
                        events.push(WatchdogEvent::Cooldown {
                            duration: self.policy.cooldown,
                        });
                        if !self.pause(self.policy.cooldown).await {
                            break StopReason::ParentSignal;
                        }
                        crashes.clear();
                        backoff = self.policy.backoff_min;
                    } else {
                        backoff = self.next_backoff(backoff, run);
                        let slept = self.jittered(backoff);
                        tracing::info!(sleep_secs = slept.as_secs_f64(), "Backing off before restart");
                        events.push(WatchdogEvent::Backoff {
                            base: backoff,
                            slept,
                        });
                        if !self.pause(slept).await {
                            break StopReason::ParentSignal;
                        }
                    }
                }
            }
        };

        tracing::info!(stop = %stop, "Watchdog loop finished");
        SupervisionReport { events, stop }
    }

    /// Exit-code file overrides the process status; shutdown marker wins;
    /// the reserved code needs the restart flag within the grace window.
    pub async fn classify(&self, raw_code: Option<i32>) -> ExitClassification {
        let code = match self.protocol.consume_exit_code().await {
            Some(code) => {
                tracing::info!(code, "Using exit code from exit-code file");
                Some(code)
            }
            None => raw_code,
        };

        if let Some(reason) = self.protocol.take_shutdown_marker() {
            tracing::info!(reason = %reason, "Shutdown marker found");
            return ExitClassification::Shutdown {
                reason: Some(reason).filter(|r| !r.is_empty()),
            };
        }

        if code == Some(self.policy.restart_exit_code) {
            if self
                .protocol
                .wait_for_restart_flag(self.policy.restart_flag_grace)
                .await
            {
                let flag = self.protocol.take_restart_flag();
                tracing::info!(
                    timestamp = %flag.timestamp,
                    user = %flag.user_label(),
                    reason = %flag.reason,
                    "Planned restart"
                );
                return ExitClassification::PlannedRestart { flag };
            }
            tracing::warn!(code, "Restart exit code without restart flag, counting as crash");
            return ExitClassification::Crash {
                code,
                missing_flag: true,
            };
        }

        if code == Some(0) {
            return ExitClassification::Graceful;
        }
        tracing::error!(exit_code = ?code, "Bot crashed, initiating recovery");
        ExitClassification::Crash {
            code,
            missing_flag: false,
        }
    }

    fn next_backoff(&self, current: Duration, run: Duration) -> Duration {
        if run >= self.policy.healthy {
            self.policy.backoff_min
        } else {
            (current * 2).min(self.policy.backoff_cap)
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=0.5 * base.as_secs_f64());
        base + Duration::from_secs_f64(jitter)
    }

    /// Sleep unless a parent signal arrives first; false when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    fn record(&self, classification: &ExitClassification) {
        let (reason, status) = match classification {
            ExitClassification::Shutdown { .. } | ExitClassification::Graceful => {
                ("scheduled", "graceful")
            }
            ExitClassification::PlannedRestart { .. } => ("manual", "success"),
            ExitClassification::Crash {
                missing_flag: true, ..
            } => ("crash", "exit_15_no_flag"),
            ExitClassification::Crash { .. } => ("crash", "crash_recovery"),
        };
        let row = [
            chrono::Utc::now().to_rfc3339(),
            reason.to_string(),
            "SYSTEM".to_string(),
            status.to_string(),
        ];
        if let Err(e) = append_csv_row(&self.paths.restart_log_file, &RESTART_LOG_HEADER, &row) {
            tracing::warn!(error = %e, "Failed to log restart");
        }
        if let ExitClassification::PlannedRestart { flag } = classification {
            self.write_last_restart_info(flag);
        }
        metrics::counter!("watchdog_restarts_total", "classification" => classification.to_string())
            .increment(1);
    }

    fn write_last_restart_info(&self, flag: &RestartFlag) {
        if let Err(e) = write_json_atomic(&self.paths.last_restart_info_file, flag) {
            tracing::warn!(error = %e, "Failed to write last restart info");
        }
    }
}
