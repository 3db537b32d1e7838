use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::offload::{CommandSpec, OffloadRunner};

pub const TASK_NAME: &str = "UPDATE_ALL2";
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// SQL Server operations the pipeline depends on.
#[async_trait]
pub trait StatsDatabase: Send + Sync {
    /// `MAX(LastRunCounter)` for a task, 0 when it never ran.
    async fn task_counter(&self, task: &str) -> Result<i64, DatabaseError>;

    /// Counter plus the duration of the latest run.
    async fn task_status(&self, task: &str) -> Result<TaskStatus, DatabaseError>;

    /// Execute the stats procedure to completion.
    async fn execute_procedure(
        &self,
        rank: Option<i64>,
        seed: Option<i64>,
        timeout: Duration,
    ) -> Result<(), DatabaseError>;

    async fn log_reuse_wait(&self) -> Result<Option<String>, DatabaseError>;

    async fn log_used_pct(&self) -> Result<Option<f64>, DatabaseError>;

    async fn last_log_backup_finish(&self) -> Result<Option<NaiveDateTime>, DatabaseError>;

    /// Start the transaction log backup job; `Ok(false)` when it could not be started.
    async fn trigger_log_backup(&self) -> Result<bool, DatabaseError>;
}

/// Row of `SP_TaskStatus` aggregated per task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskStatus {
    pub counter: i64,
    pub duration_secs: Option<f64>,
}

impl TaskStatus {
    /// Parse the `counter|duration` line produced by the status query.
    pub fn parse(raw: &str) -> Result<Self, DatabaseError> {
        let (counter, duration) = raw.split_once('|').unwrap_or((raw, ""));
        let counter = counter
            .trim()
            .parse()
            .map_err(|_| DatabaseError::Parse(format!("task status {raw:?}")))?;
        let duration = duration.trim();
        let duration_secs = if duration.is_empty() {
            None
        } else {
            Some(
                duration
                    .parse()
                    .map_err(|_| DatabaseError::Parse(format!("task duration {raw:?}")))?,
            )
        };
        Ok(Self {
            counter,
            duration_secs,
        })
    }
}

/// Connection settings for `sqlcmd`.
#[derive(Debug, Clone)]
pub struct SqlSettings {
    pub sqlcmd_path: String,
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub log_backup_job: String,
}

impl From<&AppConfig> for SqlSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            sqlcmd_path: config.sqlcmd_path.clone(),
            server: config.sql_server.clone(),
            database: config.sql_database.clone(),
            username: config.sql_username.clone(),
            password: config.sql_password.clone(),
            log_backup_job: config.log_backup_job.clone(),
        }
    }
}

/// SQL Server access through one-shot `sqlcmd` invocations.
pub struct SqlcmdDatabase {
    settings: SqlSettings,
    runner: OffloadRunner,
}

impl SqlcmdDatabase {
    pub fn new(settings: SqlSettings, runner: OffloadRunner) -> Self {
        Self { settings, runner }
    }

    /// The `sqlcmd` invocation for a query. The password travels in the
    /// environment, never on the command line.
    pub fn command(&self, sql: &str) -> CommandSpec {
        CommandSpec::new(&self.settings.sqlcmd_path)
            .arg("-S")
            .arg(&self.settings.server)
            .arg("-d")
            .arg(&self.settings.database)
            .arg("-U")
            .arg(&self.settings.username)
            .arg("-b")
            .arg("-h")
            .arg("-1")
            .arg("-W")
            .arg("-Q")
            .arg(format!("SET NOCOUNT ON; {sql}"))
            .env("SQLCMDPASSWORD", &self.settings.password)
    }

    async fn scalar(&self, sql: &str) -> Result<Option<String>, DatabaseError> {
        let spec = self.command(sql);
        let child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = tokio::time::timeout(QUERY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| DatabaseError::Timeout(QUERY_TIMEOUT.as_secs()))??;
        if !output.status.success() {
            return Err(DatabaseError::Failed {
                code: output.status.code(),
                message: failure_text(&output.stdout, &output.stderr),
            });
        }
        Ok(first_value(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn failure_text(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

/// First non-empty output line; `NULL` reads as absent.
pub fn first_value(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case("NULL"))
        .map(str::to_string)
}

/// Single-quote a value for inline T-SQL.
pub fn quote(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

fn sql_param(value: Option<i64>) -> String {
    value.map_or_else(|| "NULL".to_string(), |v| v.to_string())
}

#[async_trait]
impl StatsDatabase for SqlcmdDatabase {
    async fn task_counter(&self, task: &str) -> Result<i64, DatabaseError> {
        let sql = format!(
            "SELECT ISNULL(MAX(LastRunCounter), 0) FROM SP_TaskStatus WHERE TaskName = {}",
            quote(task)
        );
        match self.scalar(&sql).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| DatabaseError::Parse(format!("task counter {raw:?}"))),
            None => Ok(0),
        }
    }

    async fn task_status(&self, task: &str) -> Result<TaskStatus, DatabaseError> {
        let sql = format!(
            "SELECT CONCAT(ISNULL(MAX(LastRunCounter), 0), '|', \
             ISNULL(CAST(MAX(DurationSeconds) AS varchar(32)), '')) \
             FROM SP_TaskStatus WHERE TaskName = {}",
            quote(task)
        );
        match self.scalar(&sql).await? {
            Some(raw) => TaskStatus::parse(&raw),
            None => Ok(TaskStatus {
                counter: 0,
                duration_secs: None,
            }),
        }
    }

    async fn execute_procedure(
        &self,
        rank: Option<i64>,
        seed: Option<i64>,
        timeout: Duration,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "EXEC dbo.{TASK_NAME} @param1 = {}, @param2 = {}",
            sql_param(rank),
            sql_param(seed)
        );
        let mut meta = BTreeMap::new();
        meta.insert("task".to_string(), Value::from(TASK_NAME));
        let outcome = self
            .runner
            .run_in_process("sql_proc_exec", &self.command(&sql), timeout, meta)
            .await;
        if outcome.timed_out {
            return Err(DatabaseError::Timeout(timeout.as_secs()));
        }
        if !outcome.ok {
            let message = if outcome.stderr.trim().is_empty() {
                outcome.output
            } else {
                outcome.stderr
            };
            return Err(DatabaseError::Procedure(message.trim().to_string()));
        }
        Ok(())
    }

    async fn log_reuse_wait(&self) -> Result<Option<String>, DatabaseError> {
        let sql = format!(
            "SELECT log_reuse_wait_desc FROM sys.databases WHERE name = {}",
            quote(&self.settings.database)
        );
        self.scalar(&sql).await
    }

    async fn log_used_pct(&self) -> Result<Option<f64>, DatabaseError> {
        let sql = "SELECT CAST(used_log_space_in_percent AS float) FROM sys.dm_db_log_space_usage";
        match self.scalar(sql).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| DatabaseError::Parse(format!("log used percent {raw:?}"))),
            None => Ok(None),
        }
    }

    async fn last_log_backup_finish(&self) -> Result<Option<NaiveDateTime>, DatabaseError> {
        let sql = format!(
            "SELECT TOP (1) CONVERT(varchar(23), backup_finish_date, 121) \
             FROM msdb.dbo.backupset WHERE database_name = {} AND type = 'L' \
             ORDER BY backup_finish_date DESC",
            quote(&self.settings.database)
        );
        match self.scalar(&sql).await? {
            Some(raw) => NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
                .map(Some)
                .map_err(|_| DatabaseError::Parse(format!("backup finish date {raw:?}"))),
            None => Ok(None),
        }
    }

    async fn trigger_log_backup(&self) -> Result<bool, DatabaseError> {
        let sql = format!(
            "EXEC msdb.dbo.sp_start_job @job_name = {}",
            quote(&self.settings.log_backup_job)
        );
        match self.scalar(&sql).await {
            Ok(_) => {
                tracing::info!(job = %self.settings.log_backup_job, "Requested log backup job");
                Ok(true)
            }
            Err(DatabaseError::Failed { message, .. }) => {
                tracing::warn!(job = %self.settings.log_backup_job, error = %message, "Log backup job could not be started");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to run sqlcmd: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Query timed out after {0}s")]
    Timeout(u64),

    #[error("sqlcmd exited with {code:?}: {message}")]
    Failed { code: Option<i32>, message: String },

    #[error("Unexpected value for {0}")]
    Parse(String),

    #[error("Stored procedure failed: {0}")]
    Procedure(String),
}
