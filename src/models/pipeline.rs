use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Pipeline steps, displayed as their embed titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum StepName {
    #[strum(serialize = "Processing Excel File")]
    Excel,
    #[strum(serialize = "Archiving Secondary File")]
    Archive,
    #[strum(serialize = "Running SQL Procedure")]
    Sql,
    #[strum(serialize = "Rebuilding Stats Cache")]
    StatsCache,
    #[strum(serialize = "SQL Log Headroom")]
    Preflight,
    #[strum(serialize = "ProcConfig Import")]
    ProcImport,
    #[strum(serialize = "Export to Google Sheets")]
    Export,
    #[strum(serialize = "Warming Caches")]
    CacheWarm,
}

/// Where the run inputs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InputSource {
    #[strum(serialize = "🧠 Cached")]
    Cached,
    #[strum(serialize = "⚙️ Configured")]
    Configured,
}

/// Admin-provided parameters for the stats procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInputs {
    pub rank: Option<i64>,
    pub seed: Option<i64>,
    pub source: InputSource,
}

/// Collaborator log output: either a single string or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum LogText {
    One(String),
    Many(Vec<String>),
}

impl From<LogText> for String {
    fn from(text: LogText) -> Self {
        match text {
            LogText::One(s) => s,
            LogText::Many(lines) => lines.join("\n"),
        }
    }
}

/// Typed outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_log")]
    pub log: String,
}

fn deserialize_log<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<LogText>::deserialize(deserializer).map(|text| text.map(String::from).unwrap_or_default())
}

impl StepReport {
    pub fn ok(log: impl Into<String>) -> Self {
        Self {
            success: true,
            log: log.into(),
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
        }
    }
}

/// Per-step flags reported by the stats copy/archive collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFlags {
    pub excel: bool,
    pub archive: bool,
    pub sql: bool,
}

/// Canonical return shape of the stats copy/archive collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsCopyOutcome {
    pub success: Option<bool>,
    pub log: String,
    pub steps: StepFlags,
}

impl StatsCopyOutcome {
    /// Used whenever the collaborator breaks its contract.
    pub fn failure(log: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            log: log.into(),
            steps: StepFlags::default(),
        }
    }
}

/// Aggregate result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub success_excel: bool,
    pub success_archive: bool,
    pub success_sql: bool,
    pub success_export: bool,
    /// `None` when the import was not attempted
    pub success_proc_import: Option<bool>,
    pub combined_log: String,
}

impl PipelineResult {
    pub fn into_tuple(self) -> (bool, bool, bool, bool, Option<bool>, String) {
        (
            self.success_excel,
            self.success_archive,
            self.success_sql,
            self.success_export,
            self.success_proc_import,
            self.combined_log,
        )
    }
}

pub fn tick(success: bool) -> &'static str {
    if success {
        "✅"
    } else {
        "❌"
    }
}
