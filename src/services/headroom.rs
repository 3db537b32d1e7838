use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::services::database::{DatabaseError, StatsDatabase};
use crate::telemetry::emit_telemetry_event;

pub const LOG_BACKUP: &str = "LOG_BACKUP";

/// Thresholds and wait bounds for the transaction log check.
#[derive(Debug, Clone, Copy)]
pub struct HeadroomSettings {
    pub warn_pct: f64,
    pub abort_pct: f64,
    pub wait_on_backup: bool,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl From<&AppConfig> for HeadroomSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            warn_pct: config.log_warn_threshold,
            abort_pct: config.log_abort_threshold,
            wait_on_backup: config.log_wait_on_backup,
            max_wait: Duration::from_secs(config.log_backup_max_wait_secs),
            poll_interval: Duration::from_secs(config.log_backup_poll_secs),
        }
    }
}

/// Why the wait loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum WaitReason {
    Immediate,
    NewBackup,
    UsedPctDrop,
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadroomReport {
    pub reason: WaitReason,
    pub reuse_wait: Option<String>,
    pub used_pct: Option<f64>,
    pub waited: Duration,
    pub backup_triggered: bool,
}

/// Gate run before heavy imports.
#[async_trait]
pub trait HeadroomCheck: Send + Sync {
    async fn ensure(&self) -> Result<HeadroomReport, HeadroomError>;
}

fn is_log_backup(reuse_wait: Option<&str>) -> bool {
    reuse_wait.is_some_and(|w| w.eq_ignore_ascii_case(LOG_BACKUP))
}

/// Transaction log headroom check against SQL Server.
///
/// When the log is waiting on a backup, the backup job is started and the
/// check polls until a newer backup lands, used space drops below the warn
/// threshold, or `max_wait` elapses.
pub struct LogHeadroomPreflight {
    db: Arc<dyn StatsDatabase>,
    settings: HeadroomSettings,
}

impl LogHeadroomPreflight {
    pub fn new(db: Arc<dyn StatsDatabase>, settings: HeadroomSettings) -> Self {
        Self { db, settings }
    }

    fn above_abort(&self, used: Option<f64>) -> bool {
        used.is_some_and(|u| u >= self.settings.abort_pct)
    }

    fn fail(&self, reason: &str, used: Option<f64>, err: HeadroomError) -> HeadroomError {
        emit_telemetry_event(
            "log_wait_error",
            json!({
                "reason": reason,
                "used_pct": used,
                "abort_pct": self.settings.abort_pct,
            }),
        );
        tracing::error!(reason, used_pct = ?used, "Log headroom check failed");
        err
    }

    async fn wait_for_backup(
        &self,
        last_backup: Option<NaiveDateTime>,
    ) -> Result<(WaitReason, Duration), DatabaseError> {
        let started = Instant::now();
        let deadline = started + self.settings.max_wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok((WaitReason::Immediate, started.elapsed()));
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;

            let finished = self.db.last_log_backup_finish().await?;
            if finished.is_some_and(|f| last_backup.map_or(true, |prev| f > prev)) {
                return Ok((WaitReason::NewBackup, started.elapsed()));
            }
            let used = self.db.log_used_pct().await?;
            if used.is_some_and(|u| u < self.settings.warn_pct) {
                return Ok((WaitReason::UsedPctDrop, started.elapsed()));
            }
        }
    }

    async fn check(&self) -> Result<HeadroomReport, CheckFailure> {
        let reuse_wait = self.db.log_reuse_wait().await?;
        let used = self.db.log_used_pct().await?;
        let last_backup = self.db.last_log_backup_finish().await?;

        if is_log_backup(reuse_wait.as_deref()) && self.settings.wait_on_backup {
            tracing::info!(used_pct = ?used, "Log reuse is waiting on a backup; triggering log backup");
            let backup_triggered = self.db.trigger_log_backup().await?;
            let (mut reason, waited) = self.wait_for_backup(last_backup).await?;

            let reuse_after = self.db.log_reuse_wait().await?;
            let used_after = self.db.log_used_pct().await?;
            let persisted = is_log_backup(reuse_after.as_deref());
            if reason == WaitReason::Immediate && persisted {
                reason = WaitReason::Timeout;
            }
            emit_telemetry_event(
                "log_wait",
                json!({
                    "reason": reason.as_ref(),
                    "used_pct_before": used,
                    "used_pct_after": used_after,
                    "reuse_wait_after": reuse_after,
                    "waited_secs": waited.as_secs(),
                    "backup_triggered": backup_triggered,
                }),
            );

            if persisted {
                return Err(CheckFailure::Headroom(self.fail(
                    "LOG_BACKUP_persisted",
                    used_after,
                    HeadroomError::LogBackupPersisted { used_pct: used_after },
                )));
            }
            if self.above_abort(used_after) {
                return Err(CheckFailure::Headroom(self.fail(
                    "used_pct_above_abort",
                    used_after,
                    HeadroomError::AboveAbort {
                        used_pct: used_after.unwrap_or_default(),
                        abort_pct: self.settings.abort_pct,
                    },
                )));
            }
            return Ok(HeadroomReport {
                reason,
                reuse_wait: reuse_after,
                used_pct: used_after,
                waited,
                backup_triggered,
            });
        }

        emit_telemetry_event(
            "log_wait",
            json!({
                "reason": WaitReason::Immediate.as_ref(),
                "used_pct_before": used,
                "reuse_wait": reuse_wait,
            }),
        );
        if is_log_backup(reuse_wait.as_deref()) {
            return Err(CheckFailure::Headroom(self.fail(
                "LOG_BACKUP_immediate_abort",
                used,
                HeadroomError::LogBackupImmediate { used_pct: used },
            )));
        }
        if self.above_abort(used) {
            return Err(CheckFailure::Headroom(self.fail(
                "used_pct_above_abort",
                used,
                HeadroomError::AboveAbort {
                    used_pct: used.unwrap_or_default(),
                    abort_pct: self.settings.abort_pct,
                },
            )));
        }
        if used.is_some_and(|u| u >= self.settings.warn_pct) {
            tracing::warn!(used_pct = ?used, warn_pct = self.settings.warn_pct, "Transaction log usage high");
        }
        Ok(HeadroomReport {
            reason: WaitReason::Immediate,
            reuse_wait,
            used_pct: used,
            waited: Duration::ZERO,
            backup_triggered: false,
        })
    }
}

enum CheckFailure {
    Headroom(HeadroomError),
    Database(DatabaseError),
}

impl From<DatabaseError> for CheckFailure {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

#[async_trait]
impl HeadroomCheck for LogHeadroomPreflight {
    async fn ensure(&self) -> Result<HeadroomReport, HeadroomError> {
        match self.check().await {
            Ok(report) => Ok(report),
            Err(CheckFailure::Headroom(e)) => Err(e),
            Err(CheckFailure::Database(e)) => {
                emit_telemetry_event(
                    "log_wait_error",
                    json!({ "reason": "unexpected_exception:DatabaseError", "error": e.to_string() }),
                );
                tracing::error!(error = %e, "Log headroom check could not query the database");
                Err(HeadroomError::Unexpected(e.to_string()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeadroomError {
    #[error("Log reuse still waiting on LOG_BACKUP after waiting (used {used_pct:?}%)")]
    LogBackupPersisted { used_pct: Option<f64> },

    #[error("Log reuse waiting on LOG_BACKUP and waiting is disabled (used {used_pct:?}%)")]
    LogBackupImmediate { used_pct: Option<f64> },

    #[error("Transaction log {used_pct:.1}% used, at or above abort threshold {abort_pct:.1}%")]
    AboveAbort { used_pct: f64, abort_pct: f64 },

    #[error("Headroom check failed: {0}")]
    Unexpected(String),
}
