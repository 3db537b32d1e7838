use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exit code the bot uses to ask its watchdog for a relaunch.
pub const RESTART_EXIT_CODE: i32 = 15;

/// Attribution written alongside a planned restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartFlag {
    #[serde(default = "unknown")]
    pub timestamp: String,
    /// Discord ids are written as numbers by the bot but older tooling used strings
    #[serde(default = "unknown_value")]
    pub user_id: Value,
    #[serde(default = "unknown")]
    pub reason: String,
}

fn unknown() -> String {
    "unknown".to_string()
}

fn unknown_value() -> Value {
    Value::String("unknown".to_string())
}

impl RestartFlag {
    pub fn new(user_id: u64, reason: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_id: Value::from(user_id),
            reason: reason.to_string(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            timestamp: unknown(),
            user_id: unknown_value(),
            reason: unknown(),
        }
    }

    pub fn user_label(&self) -> String {
        match &self.user_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// How the watchdog interprets a child exit.
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum ExitClassification {
    /// Shutdown marker present; supervision ends
    #[strum(serialize = "shutdown")]
    Shutdown { reason: Option<String> },
    /// Reserved code plus restart flag
    #[strum(serialize = "planned_restart")]
    PlannedRestart { flag: RestartFlag },
    /// Exit code 0 without marker; supervision ends
    #[strum(serialize = "graceful")]
    Graceful,
    #[strum(serialize = "crash")]
    Crash { code: Option<i32>, missing_flag: bool },
}

impl ExitClassification {
    /// Whether the watchdog should relaunch the bot.
    pub fn relaunch(&self) -> bool {
        matches!(self, Self::PlannedRestart { .. } | Self::Crash { .. })
    }
}
