use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle of a registered offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadStatus {
    Running,
    Completed,
}

/// Where the blocking work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OffloadMode {
    Thread,
    Process,
}

/// Persisted record of one offload, keyed by `offload_id` in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadRegistryEntry {
    pub offload_id: String,
    pub name: String,
    pub mode: OffloadMode,
    pub pid: Option<u32>,
    pub status: OffloadStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ok: Option<bool>,
    pub output_snippet: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl OffloadRegistryEntry {
    pub fn started(
        name: &str,
        mode: OffloadMode,
        pid: Option<u32>,
        meta: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            offload_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            mode,
            pid,
            status: OffloadStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            ok: None,
            output_snippet: None,
            cancel_requested: false,
            meta,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OffloadStatus::Completed
    }

    /// Timestamp used for retention: end time, else start time.
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }

    pub fn timed_out(&self) -> bool {
        let flagged = self
            .meta
            .get("timed_out")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mentioned = self.output_snippet.as_deref().is_some_and(|out| {
            let out = out.to_lowercase();
            out.contains("timed out") || out.contains("timeout")
        });
        flagged || mentioned
    }
}

/// Counts reported by the offload monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OffloadStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub stale: usize,
    pub cancel_requested: usize,
    pub cancel_failed: usize,
    pub timeouts: usize,
}

/// Result of a registry rotation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationSummary {
    pub removed_count: usize,
    pub before_count: usize,
    pub after_count: usize,
}

/// Entry marked completed by the stale sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleMarked {
    pub offload_id: String,
    pub pid: u32,
    pub note: String,
}
