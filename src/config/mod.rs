use garde::Validate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bot process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Status server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Discord bot token
    #[garde(length(min = 1))]
    pub discord_token: String,

    /// Monitored upload channels (comma separated)
    #[garde(length(min = 1))]
    pub channel_ids: Vec<u64>,

    /// Channel receiving status embeds and the live queue embed
    #[garde(skip)]
    pub notify_channel_id: u64,

    /// Admin receiving per-step embeds and allowed to run `!restart` / `!shutdown`
    #[garde(skip)]
    pub admin_user_id: u64,

    /// Directory holding locks, protocol files, registries and caches
    #[serde(default = "default_data_dir")]
    #[garde(skip)]
    pub data_dir: PathBuf,

    /// Where attachments are downloaded and archived
    #[serde(default = "default_download_folder")]
    #[garde(skip)]
    pub download_folder: PathBuf,

    /// Capacity of each per-channel queue
    #[serde(default = "default_queue_capacity")]
    #[garde(range(min = 1, max = 10_000))]
    pub queue_capacity: usize,

    /// SQL Server host (passed to sqlcmd -S)
    #[garde(length(min = 1))]
    pub sql_server: String,

    #[garde(length(min = 1))]
    pub sql_database: String,

    #[garde(length(min = 1))]
    pub sql_username: String,

    #[garde(length(min = 1))]
    pub sql_password: String,

    /// sqlcmd executable
    #[serde(default = "default_sqlcmd")]
    #[garde(length(min = 1))]
    pub sqlcmd_path: String,

    /// SQL Agent job that takes a transaction log backup
    #[serde(default = "default_log_backup_job")]
    #[garde(length(min = 1))]
    pub log_backup_job: String,

    /// Google Sheets export collaborator
    #[serde(default)]
    #[garde(skip)]
    pub export_command: Option<String>,

    /// Player stats cache builder collaborator
    #[serde(default)]
    #[garde(skip)]
    pub stats_cache_command: Option<String>,

    /// Fallback "last KVK" cache builder, run when the main rebuild fails
    #[serde(default)]
    #[garde(skip)]
    pub last_kvk_cache_command: Option<String>,

    /// ProcConfig import collaborator
    #[serde(default)]
    #[garde(skip)]
    pub proc_import_command: Option<String>,

    #[serde(default = "default_export_timeout")]
    #[garde(range(min = 1))]
    pub export_timeout_secs: u64,

    #[serde(default = "default_maintenance_timeout")]
    #[garde(range(min = 1))]
    pub maintenance_timeout_secs: u64,

    /// Falls back to `maintenance_timeout_secs` when unset
    #[serde(default)]
    #[garde(skip)]
    pub proc_import_timeout_secs: Option<u64>,

    #[serde(default = "default_build_cache_timeout")]
    #[garde(range(min = 1))]
    pub build_cache_timeout_secs: u64,

    #[serde(default = "default_sql_proc_timeout")]
    #[garde(range(min = 1))]
    pub sql_proc_timeout_secs: u64,

    #[serde(default = "default_sql_poll_interval")]
    #[garde(range(min = 1))]
    pub sql_poll_interval_secs: u64,

    #[serde(default = "default_sql_poll_attempts")]
    #[garde(range(min = 1))]
    pub sql_poll_attempts: u32,

    #[serde(default = "default_log_warn_threshold")]
    #[garde(range(min = 0.0, max = 100.0))]
    pub log_warn_threshold: f64,

    #[serde(default = "default_log_abort_threshold")]
    #[garde(range(min = 0.0, max = 100.0))]
    pub log_abort_threshold: f64,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub log_wait_on_backup: bool,

    #[serde(default = "default_log_backup_max_wait")]
    #[garde(skip)]
    pub log_backup_max_wait_secs: u64,

    #[serde(default = "default_log_backup_poll")]
    #[garde(range(min = 1))]
    pub log_backup_poll_secs: u64,

    #[serde(default = "default_live_queue_retention_days")]
    #[garde(range(min = 1))]
    pub live_queue_retention_days: i64,

    #[serde(default = "default_offload_monitor_interval")]
    #[garde(range(min = 1))]
    pub offload_monitor_interval_secs: u64,

    #[serde(default = "default_offload_retention_days")]
    #[garde(range(min = 1))]
    pub offload_retention_days: i64,

    #[serde(default = "default_offload_max_entries")]
    #[garde(range(min = 1))]
    pub offload_max_entries: usize,

    /// Default rank passed to the stats procedure when no same-day admin input is cached
    #[serde(default)]
    #[garde(skip)]
    pub rank: Option<i64>,

    #[serde(default)]
    #[garde(skip)]
    pub seed: Option<i64>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_download_folder() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_queue_capacity() -> usize {
    32
}

fn default_sqlcmd() -> String {
    "sqlcmd".to_string()
}

fn default_log_backup_job() -> String {
    "ROK_TRACKER - LOG Backup".to_string()
}

fn default_export_timeout() -> u64 {
    900
}

fn default_maintenance_timeout() -> u64 {
    300
}

fn default_build_cache_timeout() -> u64 {
    60
}

fn default_sql_proc_timeout() -> u64 {
    600
}

fn default_sql_poll_interval() -> u64 {
    15
}

fn default_sql_poll_attempts() -> u32 {
    10
}

fn default_log_warn_threshold() -> f64 {
    85.0
}

fn default_log_abort_threshold() -> f64 {
    97.5
}

fn default_true() -> bool {
    true
}

fn default_log_backup_max_wait() -> u64 {
    360
}

fn default_log_backup_poll() -> u64 {
    60
}

fn default_live_queue_retention_days() -> i64 {
    7
}

fn default_offload_monitor_interval() -> u64 {
    300
}

fn default_offload_retention_days() -> i64 {
    30
}

fn default_offload_max_entries() -> usize {
    2000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable set (used by `from_env` and tests).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config
            .validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;
        if config.log_warn_threshold >= config.log_abort_threshold {
            return Err(ConfigError::Invalid(format!(
                "log_warn_threshold ({}) must be below log_abort_threshold ({})",
                config.log_warn_threshold, config.log_abort_threshold
            )));
        }
        Ok(config)
    }

    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.data_dir)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn maintenance_timeout(&self) -> Duration {
        Duration::from_secs(self.maintenance_timeout_secs)
    }

    pub fn proc_import_timeout(&self) -> Duration {
        Duration::from_secs(
            self.proc_import_timeout_secs
                .unwrap_or(self.maintenance_timeout_secs),
        )
    }

    pub fn build_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.build_cache_timeout_secs)
    }
}

/// Watchdog configuration, read from `WATCHDOG_*` variables.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WatchdogConfig {
    /// Bot executable to supervise
    #[serde(default = "default_bot_path")]
    #[garde(skip)]
    pub bot_path: PathBuf,

    #[serde(default = "default_data_dir")]
    #[garde(skip)]
    pub data_dir: PathBuf,

    #[serde(default = "default_backoff_min")]
    #[garde(range(min = 1))]
    pub backoff_min_secs: u64,

    #[serde(default = "default_backoff_cap")]
    #[garde(range(min = 1))]
    pub backoff_cap_secs: u64,

    /// A run lasting at least this long resets the backoff
    #[serde(default = "default_healthy")]
    #[garde(skip)]
    pub healthy_secs: u64,

    #[serde(default = "default_crash_window")]
    #[garde(range(min = 1))]
    pub crash_window_secs: u64,

    #[serde(default = "default_crash_threshold")]
    #[garde(range(min = 1))]
    pub crash_threshold: usize,

    #[serde(default = "default_cooldown")]
    #[garde(skip)]
    pub cooldown_secs: u64,

    /// Exit code reserved for planned restarts
    #[serde(default = "default_restart_exit_code")]
    #[garde(skip)]
    pub restart_exit_code: i32,

    /// How long to wait for the restart flag after the reserved exit code
    #[serde(default = "default_restart_flag_grace")]
    #[garde(skip)]
    pub restart_flag_grace_secs: u64,
}

fn default_bot_path() -> PathBuf {
    let name = if cfg!(windows) {
        "kvk-ingest.exe"
    } else {
        "kvk-ingest"
    };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn default_backoff_min() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_healthy() -> u64 {
    300
}

fn default_crash_window() -> u64 {
    60
}

fn default_crash_threshold() -> usize {
    5
}

fn default_cooldown() -> u64 {
    60
}

fn default_restart_exit_code() -> i32 {
    crate::models::exit::RESTART_EXIT_CODE
}

fn default_restart_flag_grace() -> u64 {
    5
}

impl WatchdogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed("WATCHDOG_").from_iter(vars)?;
        config
            .validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;
        if config.backoff_min_secs > config.backoff_cap_secs {
            return Err(ConfigError::Invalid(
                "backoff_min_secs must not exceed backoff_cap_secs".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.data_dir)
    }
}

/// Well-known files shared by the bot, the watchdog and operator tooling.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub exit_code_file: PathBuf,
    pub restart_flag_file: PathBuf,
    pub shutdown_marker_file: PathBuf,
    pub bot_pid_file: PathBuf,
    pub bot_lock_file: PathBuf,
    pub watchdog_lock_file: PathBuf,
    pub offload_registry_file: PathBuf,
    pub live_queue_file: PathBuf,
    pub restart_log_file: PathBuf,
    pub last_restart_info_file: PathBuf,
    pub download_log_file: PathBuf,
    pub summary_log_file: PathBuf,
    pub cached_input_file: PathBuf,
    pub player_stats_cache_file: PathBuf,
    pub name_cache_file: PathBuf,
    pub target_cache_file: PathBuf,
}

impl RuntimePaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            exit_code_file: data_dir.join(".exit_code"),
            restart_flag_file: data_dir.join(".restart_flag.json"),
            shutdown_marker_file: data_dir.join(".shutdown_marker"),
            bot_pid_file: data_dir.join("bot_pid.txt"),
            bot_lock_file: data_dir.join("BOT_LOCK.json"),
            watchdog_lock_file: data_dir.join("WATCHDOG_LOCK.json"),
            offload_registry_file: data_dir.join("offload_registry.json"),
            live_queue_file: data_dir.join("live_queue.json"),
            restart_log_file: data_dir.join("restart_log.csv"),
            last_restart_info_file: data_dir.join("last_restart_info.json"),
            download_log_file: data_dir.join("download_log.csv"),
            summary_log_file: data_dir.join("summary_log.csv"),
            cached_input_file: data_dir.join("cached_input.json"),
            player_stats_cache_file: data_dir.join("player_stats_cache.json"),
            name_cache_file: data_dir.join("name_cache.json"),
            target_cache_file: data_dir.join("target_cache.json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(String, String)> {
        [
            ("DISCORD_TOKEN", "token"),
            ("CHANNEL_IDS", "11,22"),
            ("NOTIFY_CHANNEL_ID", "33"),
            ("ADMIN_USER_ID", "44"),
            ("SQL_SERVER", "localhost"),
            ("SQL_DATABASE", "ROK_TRACKER"),
            ("SQL_USERNAME", "bot"),
            ("SQL_PASSWORD", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_vars(required()).unwrap();
        assert_eq!(config.channel_ids, vec![11, 22]);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.export_timeout(), Duration::from_secs(900));
        assert_eq!(config.build_cache_timeout(), Duration::from_secs(60));
        // Proc import mirrors the maintenance timeout unless tuned separately
        assert_eq!(config.proc_import_timeout(), Duration::from_secs(300));
        assert!(config.rank.is_none());
    }

    #[test]
    fn test_proc_import_timeout_override() {
        let mut vars = required();
        vars.push(("PROC_IMPORT_TIMEOUT_SECS".into(), "42".into()));
        let config = AppConfig::from_vars(vars).unwrap();
        assert_eq!(config.proc_import_timeout(), Duration::from_secs(42));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut vars = required();
        vars.push(("LOG_WARN_THRESHOLD".into(), "99".into()));
        vars.push(("LOG_ABORT_THRESHOLD".into(), "90".into()));
        assert!(matches!(
            AppConfig::from_vars(vars),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut vars = required();
        vars.push(("QUEUE_CAPACITY".into(), "0".into()));
        assert!(AppConfig::from_vars(vars).is_err());
    }

    #[test]
    fn test_watchdog_prefixed() {
        let vars = vec![
            ("WATCHDOG_CRASH_THRESHOLD".to_string(), "3".to_string()),
            ("WATCHDOG_DATA_DIR".to_string(), "/tmp/kvk".to_string()),
        ];
        let config = WatchdogConfig::from_vars(vars).unwrap();
        assert_eq!(config.crash_threshold, 3);
        assert_eq!(config.restart_exit_code, 15);
        assert_eq!(
            config.paths().exit_code_file,
            PathBuf::from("/tmp/kvk/.exit_code")
        );
    }
}
