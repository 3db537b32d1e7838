use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::AppConfig;
use crate::models::pipeline::{
    tick, InputSource, PipelineResult, RunInputs, StatsCopyOutcome, StepFlags, StepName,
    StepReport,
};
use crate::services::database::{StatsDatabase, TASK_NAME};
use crate::services::notifier::Notifier;
use crate::services::offload::{CommandSpec, OffloadRunner, OffloadWork};
use crate::services::storage::{
    append_csv_row, archive_into, archive_name, normalize_stats_file, same_file, StorageError,
    DATABOOK_ARCHIVE_DIR, IMPORT_ARCHIVE_DIR, SECONDARY_FILES,
};
use crate::telemetry::{emit_telemetry_event, snippet, MAX_SNIPPET};

/// Bound for the in-process file steps (Excel copy and archive moves).
pub const FILE_STEP_TIMEOUT: Duration = Duration::from_secs(300);
pub const RUNNING: &str = "⏳ Running...";

// ---------------------------------------------------------------------------
// Excel, archive and SQL steps
// ---------------------------------------------------------------------------

/// Inputs for one stats copy/archive run.
#[derive(Debug, Clone)]
pub struct StatsCopyRequest {
    pub rank: Option<i64>,
    pub seed: Option<i64>,
    /// Downloaded upload; `None` skips the Excel step
    pub source: Option<PathBuf>,
    /// Receives the per-step embeds
    pub user_id: u64,
}

/// Excel copy, secondary archive and stats procedure, reported as one outcome.
#[async_trait]
pub trait StatsCopyArchive: Send + Sync {
    async fn run(
        &self,
        request: &StatsCopyRequest,
        notifier: &dyn Notifier,
    ) -> Result<StatsCopyOutcome, ContractViolation>;
}

/// Polling bounds for the stats procedure.
#[derive(Debug, Clone, Copy)]
pub struct SqlStepSettings {
    pub proc_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl From<&AppConfig> for SqlStepSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            proc_timeout: Duration::from_secs(config.sql_proc_timeout_secs),
            poll_interval: Duration::from_secs(config.sql_poll_interval_secs),
            poll_attempts: config.sql_poll_attempts,
        }
    }
}

/// Write `stats.csv` (plus the `stats.<ext>` workbook copy) and archive the
/// original upload.
pub fn process_excel_file(
    source: &Path,
    download_folder: &Path,
    at: DateTime<Utc>,
) -> Result<String, String> {
    if !source.is_file() {
        tracing::error!(source = %source.display(), "Source file does not exist");
        return Err(format!("[ERROR] Source file not found: {}", source.display()));
    }
    tracing::info!(source = %source.display(), "Processing Excel file");
    let output = normalize_stats_file(source, download_folder, at)
        .map_err(|e| format!("[ERROR] Excel processing failed: {e}"))?;

    let archive_dir = download_folder.join(DATABOOK_ARCHIVE_DIR);
    let keep_source = same_file(source, &output.csv)
        || output.workbook.as_deref().is_some_and(|w| same_file(source, w));
    let archived = if keep_source {
        // The upload already is a normalized file; keep it and archive a copy.
        let dst = archive_dir.join(archive_name(source, at));
        std::fs::create_dir_all(&archive_dir)
            .and_then(|_| std::fs::copy(source, &dst))
            .map(|_| dst)
            .map_err(StorageError::from)
    } else {
        archive_into(source, &archive_dir, at)
    };
    match archived {
        Ok(path) => tracing::info!(archive = %path.display(), "Archived original upload"),
        Err(e) => return Err(format!("[ERROR] Excel processing failed: {e}")),
    }
    Ok("[INFO] Excel processed successfully.".to_string())
}

/// Move the `stats.xlsx` / `stats.xls` workbook copy into the import
/// archive; `stats.csv` stays behind for the import. Absent is a skip.
pub fn archive_second_file(download_folder: &Path, at: DateTime<Utc>) -> Result<String, String> {
    let present: Vec<PathBuf> = SECONDARY_FILES
        .iter()
        .map(|name| download_folder.join(name))
        .filter(|path| path.is_file())
        .collect();
    if present.is_empty() {
        return Ok(format!(
            "[INFO] Skipped secondary archive ({} not present).",
            SECONDARY_FILES.join(" / ")
        ));
    }
    let archive_dir = download_folder.join(IMPORT_ARCHIVE_DIR);
    for source in &present {
        archive_into(source, &archive_dir, at)
            .map_err(|e| format!("[ERROR] Archiving second file failed: {e}"))?;
    }
    Ok("[INFO] Second file archived.".to_string())
}

/// Execute the stats procedure and poll its counter until it advances.
pub async fn run_sql_procedure(
    db: &dyn StatsDatabase,
    rank: Option<i64>,
    seed: Option<i64>,
    settings: SqlStepSettings,
) -> StepReport {
    let original = match db.task_counter(TASK_NAME).await {
        Ok(counter) => counter,
        Err(e) => return sql_failed(e),
    };
    if let Err(e) = db.execute_procedure(rank, seed, settings.proc_timeout).await {
        return sql_failed(e);
    }
    let expected = original + 1;

    for attempt in 1..=settings.poll_attempts {
        tracing::info!(attempt, expected, "Waiting for SQL counter to increment");
        tokio::time::sleep(settings.poll_interval).await;
        match db.task_status(TASK_NAME).await {
            Ok(status) if status.counter >= expected => {
                let duration = status
                    .duration_secs
                    .map_or_else(|| "n/a".to_string(), |d| d.to_string());
                emit_telemetry_event(
                    "sql_proc",
                    json!({ "status": "success", "task_name": TASK_NAME, "counter": status.counter }),
                );
                return StepReport::ok(format!(
                    "[SUCCESS] Counter reached {}. Duration: {duration}s",
                    status.counter
                ));
            }
            Ok(status) => tracing::debug!(counter = status.counter, expected, "Counter not reached yet"),
            Err(e) => tracing::warn!(attempt, error = %e, "Failed to read task status"),
        }
    }
    emit_telemetry_event(
        "sql_proc",
        json!({ "status": "timeout", "task_name": TASK_NAME, "expected": expected }),
    );
    StepReport::failed("[TIMEOUT] Procedure did not complete in time.")
}

fn sql_failed(e: impl std::fmt::Display) -> StepReport {
    tracing::error!(error = %e, "SQL procedure execution failed");
    emit_telemetry_event(
        "sql_proc",
        json!({
            "status": "failed",
            "task_name": TASK_NAME,
            "orphaned_offload_possible": false,
        }),
    );
    StepReport::failed(format!("[ERROR] SQL execution failed: {e}"))
}

/// Announce a step to the uploader, run it, then announce its result.
pub async fn announce_step<F>(
    notifier: &dyn Notifier,
    user_id: u64,
    step: StepName,
    work: F,
) -> StepReport
where
    F: Future<Output = StepReport>,
{
    notifier.step(user_id, step.as_ref(), RUNNING).await;
    let report = work.await;
    tracing::info!(step = %step, success = report.success, "Step finished");
    notifier
        .step(user_id, step.as_ref(), &format!("{} {}", tick(report.success), report.log))
        .await;
    report
}

fn log_part(step: StepName, report: &StepReport) -> String {
    format!("{} **{}**\n{}", tick(report.success), step, report.log)
}

/// File steps on worker threads, the procedure in maintenance isolation.
pub struct StatsCopySteps {
    download_folder: PathBuf,
    db: Arc<dyn StatsDatabase>,
    runner: OffloadRunner,
    sql: SqlStepSettings,
}

impl StatsCopySteps {
    pub fn new(
        download_folder: PathBuf,
        db: Arc<dyn StatsDatabase>,
        runner: OffloadRunner,
        sql: SqlStepSettings,
    ) -> Self {
        Self {
            download_folder,
            db,
            runner,
            sql,
        }
    }

    async fn file_step<F>(&self, name: &str, source: &Path, work: F) -> StepReport
    where
        F: FnOnce() -> Result<String, String> + Send + 'static,
    {
        let mut meta = BTreeMap::new();
        meta.insert("source".to_string(), Value::from(source.display().to_string()));
        let outcome = self
            .runner
            .run(name, OffloadWork::Thread(Box::new(work)), FILE_STEP_TIMEOUT, meta)
            .await;
        StepReport {
            success: outcome.ok,
            log: outcome.output,
        }
    }
}

#[async_trait]
impl StatsCopyArchive for StatsCopySteps {
    async fn run(
        &self,
        request: &StatsCopyRequest,
        notifier: &dyn Notifier,
    ) -> Result<StatsCopyOutcome, ContractViolation> {
        let mut parts = Vec::new();
        let mut steps = StepFlags::default();

        if let Some(source) = &request.source {
            let (src, folder) = (source.clone(), self.download_folder.clone());
            let report = announce_step(
                notifier,
                request.user_id,
                StepName::Excel,
                self.file_step("process_excel_file", source, move || {
                    process_excel_file(&src, &folder, Utc::now())
                }),
            )
            .await;
            steps.excel = report.success;
            parts.push(log_part(StepName::Excel, &report));
        }

        let folder = self.download_folder.clone();
        let excel_ran = request.source.is_some();
        let report = announce_step(notifier, request.user_id, StepName::Archive, async {
            if !excel_ran {
                return StepReport::ok("[INFO] Skipped secondary archive (Excel step not run).");
            }
            self.file_step("archive_second_file", &self.download_folder, move || {
                archive_second_file(&folder, Utc::now())
            })
            .await
        })
        .await;
        steps.archive = report.success;
        parts.push(log_part(StepName::Archive, &report));

        let report = announce_step(
            notifier,
            request.user_id,
            StepName::Sql,
            run_sql_procedure(self.db.as_ref(), request.rank, request.seed, self.sql),
        )
        .await;
        steps.sql = report.success;
        parts.push(log_part(StepName::Sql, &report));

        let all = (!excel_ran || steps.excel) && steps.archive && steps.sql;
        Ok(StatsCopyOutcome {
            success: Some(all),
            log: parts.join("\n\n"),
            steps,
        })
    }
}

// ---------------------------------------------------------------------------
// Command collaborators (stats cache, ProcConfig import, export)
// ---------------------------------------------------------------------------

/// A collaborator step bounded by a timeout.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, timeout: Duration) -> Result<StepReport, StepError>;
}

/// External program run in maintenance isolation. It must print a JSON
/// `{"success": bool, "log": str | [str]}` object as its last stdout line.
pub struct CommandStep {
    name: String,
    command: CommandSpec,
    runner: OffloadRunner,
}

impl CommandStep {
    pub fn new(name: impl Into<String>, command: CommandSpec, runner: OffloadRunner) -> Self {
        Self {
            name: name.into(),
            command,
            runner,
        }
    }

    /// `None` when no command line is configured.
    pub fn from_config(
        name: &str,
        line: Option<&str>,
        runner: &OffloadRunner,
    ) -> Option<Arc<dyn PipelineStep>> {
        let command = CommandSpec::parse(line?)?;
        Some(Arc::new(Self::new(name, command, runner.clone())))
    }
}

/// Read the step report from collaborator stdout.
pub fn parse_report(step: &str, stdout: &str) -> Result<StepReport, ContractViolation> {
    let candidate = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .unwrap_or(stdout.trim());
    serde_json::from_str(candidate).map_err(|e| ContractViolation {
        step: step.to_string(),
        detail: format!("{e}; output: {}", snippet(stdout.trim(), 200)),
    })
}

#[async_trait]
impl PipelineStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, timeout: Duration) -> Result<StepReport, StepError> {
        let mut meta = BTreeMap::new();
        meta.insert("program".to_string(), Value::from(self.command.program.clone()));
        let outcome = self
            .runner
            .run(&self.name, OffloadWork::Process(self.command.clone()), timeout, meta)
            .await;
        if outcome.timed_out {
            return Err(StepError::Timeout {
                step: self.name.clone(),
                secs: timeout.as_secs(),
                offload_id: outcome.offload_id,
            });
        }
        match parse_report(&self.name, &outcome.output) {
            Ok(report) => Ok(report),
            Err(violation) if outcome.ok => Err(StepError::Contract(violation)),
            Err(_) => {
                let text = if outcome.stderr.trim().is_empty() {
                    outcome.output
                } else {
                    outcome.stderr
                };
                Err(StepError::Failed(snippet(text.trim(), MAX_SNIPPET)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache warm-up
// ---------------------------------------------------------------------------

/// Entries in a JSON cache: `_meta.count` when present, otherwise the
/// number of top-level entries.
pub fn cache_entry_count(value: &Value) -> usize {
    if let Some(count) = value
        .get("_meta")
        .and_then(|meta| meta.get("count"))
        .and_then(Value::as_u64)
    {
        return count as usize;
    }
    match value {
        Value::Object(map) => map.keys().filter(|k| k.as_str() != "_meta").count(),
        Value::Array(items) => items.len(),
        _ => 0,
    }
}

pub fn read_json_cache(path: &Path) -> Result<Value, StorageError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// In-memory copies of the name and target caches.
pub struct CacheWarmer {
    name_path: PathBuf,
    target_path: PathBuf,
    names: RwLock<Value>,
    targets: RwLock<Value>,
}

/// Entry counts from one warm-up; failures carry the error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmSummary {
    pub names: Result<usize, String>,
    pub targets: Result<usize, String>,
}

impl CacheWarmer {
    pub fn new(name_path: PathBuf, target_path: PathBuf) -> Self {
        Self {
            name_path,
            target_path,
            names: RwLock::new(Value::Null),
            targets: RwLock::new(Value::Null),
        }
    }

    fn reload(path: &Path, slot: &RwLock<Value>, label: &str) -> Result<usize, String> {
        match read_json_cache(path) {
            Ok(value) => {
                let count = cache_entry_count(&value);
                if let Ok(mut slot) = slot.write() {
                    *slot = value;
                }
                tracing::info!(cache = label, count, "Cache warmed");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(cache = label, path = %path.display(), error = %e, "Cache warm failed");
                Err(e.to_string())
            }
        }
    }

    /// Reload both caches; each failure is logged and swallowed.
    pub fn warm(&self) -> WarmSummary {
        WarmSummary {
            names: Self::reload(&self.name_path, &self.names, "name"),
            targets: Self::reload(&self.target_path, &self.targets, "target"),
        }
    }

    pub fn name_count(&self) -> usize {
        self.names.read().map(|v| cache_entry_count(&v)).unwrap_or(0)
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().map(|v| cache_entry_count(&v)).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Run inputs and audit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CachedInput {
    date: String,
    #[serde(default)]
    rank: Option<i64>,
    #[serde(default)]
    seed: Option<i64>,
}

/// Same-day admin inputs from `cached_input.json`, else the configured defaults.
pub fn load_run_inputs(
    path: &Path,
    default_rank: Option<i64>,
    default_seed: Option<i64>,
    today: NaiveDate,
) -> RunInputs {
    let cached = std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<CachedInput>(&bytes).ok())
        .filter(|input| input.date == today.format("%Y-%m-%d").to_string());
    match cached {
        Some(input) => RunInputs {
            rank: input.rank,
            seed: input.seed,
            source: InputSource::Cached,
        },
        None => RunInputs {
            rank: default_rank,
            seed: default_seed,
            source: InputSource::Configured,
        },
    }
}

pub const SUMMARY_HEADER: [&str; 12] = [
    "Timestamp",
    "End",
    "Filename",
    "User",
    "Rank",
    "Seed",
    "Excel",
    "Archive",
    "SQL",
    "Export",
    "ProcImport",
    "DurationSeconds",
];

/// One audit row per pipeline run.
#[derive(Debug, Clone)]
pub struct RunSummary<'a> {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub filename: &'a str,
    pub user: &'a str,
    pub inputs: &'a RunInputs,
    pub result: &'a PipelineResult,
}

fn flag(value: bool) -> String {
    value.to_string()
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn append_summary(path: &Path, summary: &RunSummary<'_>) -> Result<(), StorageError> {
    let duration = (summary.finished - summary.started).num_milliseconds() as f64 / 1000.0;
    let result = summary.result;
    let row = vec![
        summary.started.format("%Y-%m-%d %H:%M:%S").to_string(),
        summary.finished.format("%Y-%m-%d %H:%M:%S").to_string(),
        summary.filename.to_string(),
        summary.user.to_string(),
        optional(summary.inputs.rank),
        optional(summary.inputs.seed),
        flag(result.success_excel),
        flag(result.success_archive),
        flag(result.success_sql),
        flag(result.success_export),
        result
            .success_proc_import
            .map_or_else(|| "skipped".to_string(), flag),
        format!("{duration:.1}"),
    ];
    append_csv_row(path, &SUMMARY_HEADER, &row)
}

#[derive(Debug, thiserror::Error)]
#[error("{step} returned an unexpected shape: {detail}")]
pub struct ContractViolation {
    pub step: String,
    pub detail: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{step} timed out after {secs}s (offload {offload_id})")]
    Timeout {
        step: String,
        secs: u64,
        offload_id: String,
    },

    #[error(transparent)]
    Contract(#[from] ContractViolation),

    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::{DatabaseError, TaskStatus};
    use crate::services::notifier::{Destination, RecordingNotifier};
    use crate::services::offload::OffloadRegistry;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Counter advances `lag` polls after the procedure runs.
    struct CounterDb {
        counter: AtomicI64,
        polls_until_done: AtomicI64,
        fail_exec: bool,
    }

    impl CounterDb {
        fn new(start: i64, lag: i64) -> Self {
            Self {
                counter: AtomicI64::new(start),
                polls_until_done: AtomicI64::new(lag),
                fail_exec: false,
            }
        }
    }

    #[async_trait]
    impl StatsDatabase for CounterDb {
        async fn task_counter(&self, _task: &str) -> Result<i64, DatabaseError> {
            Ok(self.counter.load(Ordering::SeqCst))
        }
        async fn task_status(&self, _task: &str) -> Result<TaskStatus, DatabaseError> {
            if self.polls_until_done.fetch_sub(1, Ordering::SeqCst) <= 1 {
                self.counter.fetch_add(1, Ordering::SeqCst);
                self.polls_until_done.store(i64::MAX, Ordering::SeqCst);
            }
            Ok(TaskStatus {
                counter: self.counter.load(Ordering::SeqCst),
                duration_secs: Some(12.0),
            })
        }
        async fn execute_procedure(
            &self,
            _rank: Option<i64>,
            _seed: Option<i64>,
            _timeout: Duration,
        ) -> Result<(), DatabaseError> {
            if self.fail_exec {
                return Err(DatabaseError::Procedure("deadlock".into()));
            }
            Ok(())
        }
        async fn log_reuse_wait(&self) -> Result<Option<String>, DatabaseError> {
            Ok(None)
        }
        async fn log_used_pct(&self) -> Result<Option<f64>, DatabaseError> {
            Ok(None)
        }
        async fn last_log_backup_finish(
            &self,
        ) -> Result<Option<chrono::NaiveDateTime>, DatabaseError> {
            Ok(None)
        }
        async fn trigger_log_backup(&self) -> Result<bool, DatabaseError> {
            Ok(true)
        }
    }

    fn sql_settings() -> SqlStepSettings {
        SqlStepSettings {
            proc_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(15),
            poll_attempts: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sql_counter_reached() {
        let db = CounterDb::new(41, 2);
        let report = run_sql_procedure(&db, Some(1), Some(2), sql_settings()).await;
        assert!(report.success);
        assert_eq!(report.log, "[SUCCESS] Counter reached 42. Duration: 12s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sql_poll_timeout() {
        let db = CounterDb::new(5, i64::MAX);
        let started = tokio::time::Instant::now();
        let report = run_sql_procedure(&db, None, None, sql_settings()).await;
        assert!(!report.success);
        assert_eq!(report.log, "[TIMEOUT] Procedure did not complete in time.");
        assert_eq!(started.elapsed(), Duration::from_secs(150));
    }

    #[tokio::test]
    async fn test_sql_exec_failure() {
        let db = CounterDb {
            fail_exec: true,
            ..CounterDb::new(0, 1)
        };
        let report = run_sql_procedure(&db, None, None, sql_settings()).await;
        assert!(!report.success);
        assert!(report.log.starts_with("[ERROR] SQL execution failed:"));
    }

    fn write_workbook(path: &Path) {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "governor_id").unwrap();
        sheet.write_number(1, 0, 7.0).unwrap();
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_excel_step_archives_original() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Kingdom.xlsx");
        write_workbook(&source);
        let at = Utc.with_ymd_and_hms(2025, 6, 2, 14, 7, 0).unwrap();

        let message = process_excel_file(&source, dir.path(), at).unwrap();
        assert_eq!(message, "[INFO] Excel processed successfully.");
        assert!(!source.exists());
        assert!(dir.path().join("stats.xlsx").is_file());
        assert!(dir.path().join("stats.csv").is_file());
        assert!(dir
            .path()
            .join(DATABOOK_ARCHIVE_DIR)
            .join("Kingdom_2025-06-02_1407.xlsx")
            .is_file());
    }

    #[test]
    fn test_excel_step_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.xlsx");
        let err = process_excel_file(&missing, dir.path(), Utc::now()).unwrap_err();
        assert!(err.starts_with("[ERROR] Source file not found:"));
    }

    #[test]
    fn test_secondary_archive_skip_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2025, 6, 2, 14, 7, 0).unwrap();
        assert!(archive_second_file(dir.path(), at).unwrap().contains("Skipped"));

        std::fs::write(dir.path().join("stats.xls"), b"wb").unwrap();
        std::fs::write(dir.path().join("stats.csv"), "id\n1\n").unwrap();
        assert_eq!(
            archive_second_file(dir.path(), at).unwrap(),
            "[INFO] Second file archived."
        );
        assert!(dir
            .path()
            .join(IMPORT_ARCHIVE_DIR)
            .join("stats_2025-06-02_1407.xls")
            .is_file());
        assert!(!dir.path().join("stats.xls").exists());
        assert!(dir.path().join("stats.csv").is_file());
    }

    fn quick_sql() -> SqlStepSettings {
        SqlStepSettings {
            poll_interval: Duration::from_millis(10),
            ..sql_settings()
        }
    }

    #[tokio::test]
    async fn test_stats_copy_steps_embeds_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.csv");
        std::fs::write(&source, "id\n1\n").unwrap();
        let registry = Arc::new(OffloadRegistry::new(dir.path().join("registry.json")));
        let steps = StatsCopySteps::new(
            dir.path().to_path_buf(),
            Arc::new(CounterDb::new(0, 1)),
            OffloadRunner::new(registry),
            quick_sql(),
        );
        let notifier = RecordingNotifier::new();
        let request = StatsCopyRequest {
            rank: None,
            seed: None,
            source: Some(source),
            user_id: 5,
        };

        let outcome = steps.run(&request, &notifier).await.unwrap();
        assert_eq!(outcome.success, Some(true));
        assert_eq!(
            outcome.steps,
            StepFlags {
                excel: true,
                archive: true,
                sql: true
            }
        );
        assert!(outcome.log.starts_with("✅ **Processing Excel File**\n[INFO] Excel processed successfully."));
        assert_eq!(outcome.log.matches("\n\n").count(), 2);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|(to, _)| *to == Destination::User(5)));
        assert_eq!(sent[0].1.field_value("Status"), Some(RUNNING));
    }

    #[tokio::test]
    async fn test_workbook_run_leaves_stats_csv_for_import() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Kingdom.xlsx");
        write_workbook(&source);
        let registry = Arc::new(OffloadRegistry::new(dir.path().join("registry.json")));
        let steps = StatsCopySteps::new(
            dir.path().to_path_buf(),
            Arc::new(CounterDb::new(0, 1)),
            OffloadRunner::new(registry),
            quick_sql(),
        );
        let request = StatsCopyRequest {
            rank: None,
            seed: None,
            source: Some(source),
            user_id: 5,
        };

        let outcome = steps.run(&request, &RecordingNotifier::new()).await.unwrap();
        assert_eq!(outcome.success, Some(true));
        assert!(outcome.log.contains("[INFO] Second file archived."));

        let csv = std::fs::read_to_string(dir.path().join("stats.csv")).unwrap();
        assert!(csv.starts_with("governor_id,updated_on\n7,"));
        assert!(!dir.path().join("stats.xlsx").exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join(IMPORT_ARCHIVE_DIR)).unwrap().count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stats_copy_without_source_skips_excel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(OffloadRegistry::new(dir.path().join("registry.json")));
        let steps = StatsCopySteps::new(
            dir.path().to_path_buf(),
            Arc::new(CounterDb::new(0, 1)),
            OffloadRunner::new(registry),
            quick_sql(),
        );
        let notifier = RecordingNotifier::new();
        let request = StatsCopyRequest {
            rank: None,
            seed: None,
            source: None,
            user_id: 5,
        };
        let outcome = steps.run(&request, &notifier).await.unwrap();
        assert!(!outcome.steps.excel);
        assert!(outcome.steps.archive);
        assert!(outcome.log.contains("Excel step not run"));
    }

    #[test]
    fn test_parse_report_takes_last_json_line() {
        let report = parse_report("export", "starting\n{\"success\": true, \"log\": \"3 sheets\"}\n").unwrap();
        assert_eq!(report, StepReport::ok("3 sheets"));
        let err = parse_report("export", "[true, \"done\"]").unwrap_err();
        assert_eq!(err.step, "export");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_step_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OffloadRunner::new(Arc::new(OffloadRegistry::new(dir.path().join("r.json"))));
        let step = CommandStep::new(
            "export",
            CommandSpec::new("sh").arg("-c").arg("echo done"),
            runner.clone(),
        );
        assert!(matches!(
            step.run(Duration::from_secs(10)).await,
            Err(StepError::Contract(_))
        ));

        let step = CommandStep::new(
            "export",
            CommandSpec::new("sh")
                .arg("-c")
                .arg(r#"echo '{"success": false, "log": ["a", "b"]}'"#),
            runner,
        );
        let report = step.run(Duration::from_secs(10)).await.unwrap();
        assert_eq!(report, StepReport::failed("a\nb"));
    }

    #[test]
    fn test_cache_counts() {
        assert_eq!(cache_entry_count(&json!({"_meta": {"count": 7}, "rows": []})), 7);
        assert_eq!(cache_entry_count(&json!({"_meta": {}, "a": 1, "b": 2})), 2);
        assert_eq!(cache_entry_count(&json!([1, 2, 3])), 3);
    }

    #[test]
    fn test_cache_warmer_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let names = dir.path().join("name_cache.json");
        std::fs::write(&names, r#"{"1": "Alice", "2": "Bob"}"#).unwrap();
        let warmer = CacheWarmer::new(names, dir.path().join("missing.json"));
        let summary = warmer.warm();
        assert_eq!(summary.names, Ok(2));
        assert!(summary.targets.is_err());
        assert_eq!(warmer.name_count(), 2);
        assert_eq!(warmer.target_count(), 0);
    }

    #[test]
    fn test_run_inputs_same_day_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cached_input.json");
        let today = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();

        let inputs = load_run_inputs(&path, Some(1), Some(2), today);
        assert_eq!(inputs.source, InputSource::Configured);

        std::fs::write(&path, r#"{"date": "2025-06-02", "rank": 10, "seed": 20}"#).unwrap();
        let inputs = load_run_inputs(&path, Some(1), Some(2), today);
        assert_eq!((inputs.rank, inputs.seed, inputs.source), (Some(10), Some(20), InputSource::Cached));

        std::fs::write(&path, r#"{"date": "2025-06-01", "rank": 10, "seed": 20}"#).unwrap();
        let inputs = load_run_inputs(&path, Some(1), Some(2), today);
        assert_eq!(inputs.rank, Some(1));
    }

    #[test]
    fn test_summary_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary_log.csv");
        let started = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let inputs = RunInputs {
            rank: Some(3),
            seed: None,
            source: InputSource::Configured,
        };
        let result = PipelineResult {
            success_excel: true,
            success_archive: true,
            success_sql: false,
            success_export: true,
            success_proc_import: None,
            combined_log: String::new(),
        };
        append_summary(
            &path,
            &RunSummary {
                started,
                finished: started + chrono::Duration::seconds(90),
                filename: "stats.xlsx",
                user: "bob",
                inputs: &inputs,
                result: &result,
            },
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], SUMMARY_HEADER.join(","));
        assert_eq!(
            lines[1],
            "2025-06-02 14:00:00,2025-06-02 14:01:30,stats.xlsx,bob,3,,true,true,false,true,skipped,90.0"
        );
    }
}
