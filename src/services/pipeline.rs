use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AppConfig, RuntimePaths};
use crate::models::job::{Job, UserRef};
use crate::models::live_queue::OutcomeIcon;
use crate::models::pipeline::{tick, PipelineResult, RunInputs, StatsCopyOutcome, StepName};
use crate::services::collaborators::{
    append_summary, load_run_inputs, CacheWarmer, PipelineStep, RunSummary, StatsCopyArchive,
    StatsCopyRequest, StepError, RUNNING,
};
use crate::services::headroom::HeadroomCheck;
use crate::services::live_queue::LiveQueue;
use crate::services::notifier::{
    Destination, Notifier, StatusEmbed, COLOUR_FAILURE, COLOUR_INFO, COLOUR_RUNNING,
    COLOUR_SUCCESS,
};
use crate::telemetry::{emit_telemetry_event, snippet, MAX_SNIPPET};

const STATS_CACHE_TITLE: &str = "🗂️ Player Stats Cache";
const PROC_IMPORT_TITLE: &str = "🛠️ ProcConfig Import";

/// Timeouts for the collaborator steps.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    pub export: Duration,
    pub proc_import: Duration,
    pub build_cache: Duration,
}

impl From<&AppConfig> for PipelineTimeouts {
    fn from(config: &AppConfig) -> Self {
        Self {
            export: config.export_timeout(),
            proc_import: config.proc_import_timeout(),
            build_cache: config.build_cache_timeout(),
        }
    }
}

/// Collaborators the pipeline drives. Unconfigured command steps are `None`.
pub struct PipelineDeps {
    pub notifier: Arc<dyn Notifier>,
    pub stats_copy: Arc<dyn StatsCopyArchive>,
    pub stats_cache: Option<Arc<dyn PipelineStep>>,
    pub last_kvk_cache: Option<Arc<dyn PipelineStep>>,
    pub headroom: Arc<dyn HeadroomCheck>,
    pub proc_import: Option<Arc<dyn PipelineStep>>,
    pub export: Option<Arc<dyn PipelineStep>>,
    pub cache_warmer: Arc<CacheWarmer>,
    pub timeouts: PipelineTimeouts,
    pub notify_channel_id: u64,
}

/// One pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub rank: Option<i64>,
    pub seed: Option<i64>,
    pub filename: String,
    pub source: Option<PathBuf>,
    pub user: UserRef,
}

fn record_step(step: StepName, outcome: &str) {
    metrics::counter!("pipeline_steps_total", "step" => format!("{step:?}"), "outcome" => outcome.to_string())
        .increment(1);
}

fn outcome_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failed"
    }
}

/// Step error to `(status, log)` for telemetry and the combined log.
fn describe_error(e: &StepError) -> (&'static str, String) {
    match e {
        StepError::Timeout { .. } => ("timeout", format!("[TIMEOUT] {e}")),
        StepError::Contract(_) => ("failed", format!("[ERROR] {e}")),
        StepError::Failed(text) => ("failed", format!("[ERROR] {text}")),
    }
}

impl PipelineDeps {
    async fn notify(&self, embed: StatusEmbed) {
        self.notifier
            .send(Destination::Channel(self.notify_channel_id), embed)
            .await;
    }

    async fn stats_copy(&self, request: &PipelineRequest) -> StatsCopyOutcome {
        let copy_request = StatsCopyRequest {
            rank: request.rank,
            seed: request.seed,
            source: request.source.clone(),
            user_id: request.user.id,
        };
        match self.stats_copy.run(&copy_request, self.notifier.as_ref()).await {
            Ok(outcome) => outcome,
            Err(violation) => {
                tracing::warn!(error = %violation, "Stats copy returned an unexpected result; treating as failure");
                StatsCopyOutcome::failure(format!("❌ {violation}"))
            }
        }
    }

    async fn rebuild_stats_cache(&self) {
        let Some(builder) = &self.stats_cache else {
            tracing::info!("Stats cache builder not configured; skipping rebuild");
            return;
        };
        self.notify(StatusEmbed::new(STATS_CACHE_TITLE, COLOUR_RUNNING).field("Status", RUNNING, false))
            .await;
        let rebuilt = match builder.run(self.timeouts.build_cache).await {
            Ok(report) if report.success => {
                tracing::info!(log = %report.log, "Player stats cache rebuilt");
                true
            }
            Ok(report) => {
                tracing::warn!(log = %report.log, "Player stats cache rebuild reported failure");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Player stats cache rebuild failed");
                false
            }
        };
        record_step(StepName::StatsCache, outcome_label(rebuilt));

        let mut embed = StatusEmbed::new(
            STATS_CACHE_TITLE,
            if rebuilt { COLOUR_SUCCESS } else { COLOUR_FAILURE },
        )
        .field("Status", if rebuilt { "✅ Rebuilt" } else { "❌ Failed" }, true);
        if !rebuilt {
            if let Some(fallback) = &self.last_kvk_cache {
                let built = match fallback.run(self.timeouts.build_cache).await {
                    Ok(report) => {
                        tracing::info!(success = report.success, "Last KVK cache build finished");
                        report.success
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Last KVK cache build failed");
                        false
                    }
                };
                embed = embed.field("Last KVK Cache", tick(built), true);
            }
        }
        self.notify(embed).await;
    }

    /// `None` when the import was not attempted.
    async fn proc_import(&self, sql_ok: bool) -> Option<bool> {
        if sql_ok {
            if let Err(e) = self.headroom.ensure().await {
                tracing::warn!(error = %e, "Skipping ProcConfig import: insufficient log headroom");
                record_step(StepName::ProcImport, "skipped");
                emit_telemetry_event(
                    "proc_import",
                    json!({ "status": "skipped", "reason": "headroom", "error": e.to_string() }),
                );
                self.notify(
                    StatusEmbed::new(PROC_IMPORT_TITLE, COLOUR_RUNNING)
                        .field("Status", "Skipped", true)
                        .field("Reason", e.to_string(), false),
                )
                .await;
                return None;
            }
        }

        let Some(import) = &self.proc_import else {
            tracing::info!("ProcConfig import not configured; skipping");
            return None;
        };
        self.notify(StatusEmbed::new(PROC_IMPORT_TITLE, COLOUR_RUNNING).field("Status", RUNNING, false))
            .await;
        let timeout = self.timeouts.proc_import;
        let (success, log, offload_id) = match import.run(timeout).await {
            Ok(report) => {
                emit_telemetry_event(
                    "proc_import",
                    json!({ "status": outcome_label(report.success), "timeout_secs": timeout.as_secs() }),
                );
                (report.success, report.log, None)
            }
            Err(e) => {
                let (status, log) = describe_error(&e);
                let offload_id = match &e {
                    StepError::Timeout { offload_id, .. } => Some(offload_id.clone()),
                    _ => None,
                };
                tracing::error!(error = %e, status, "ProcConfig import failed");
                emit_telemetry_event(
                    "proc_import",
                    json!({
                        "status": status,
                        "timeout_secs": timeout.as_secs(),
                        "offload_id": offload_id,
                        "orphaned_offload_possible": false,
                    }),
                );
                (false, log, offload_id)
            }
        };
        record_step(StepName::ProcImport, outcome_label(success));
        let (status, colour) = if success {
            ("Completed", COLOUR_SUCCESS)
        } else {
            ("Failed", COLOUR_FAILURE)
        };
        let mut embed = StatusEmbed::new(PROC_IMPORT_TITLE, colour)
            .field("Status", status, true)
            .field("Log", snippet(&log, MAX_SNIPPET), false);
        if let Some(id) = offload_id {
            embed = embed.field("Offload ID", id, true);
        }
        self.notify(embed).await;
        Some(success)
    }

    async fn export(&self) -> (bool, String) {
        self.notify(
            StatusEmbed::new("📤 Export to Google Sheets", COLOUR_RUNNING)
                .field("Status", RUNNING, false),
        )
        .await;

        let timeout = self.timeouts.export;
        let (success, log) = match &self.export {
            None => (false, "[ERROR] Export command not configured.".to_string()),
            Some(export) => match export.run(timeout).await {
                Ok(report) => {
                    emit_telemetry_event(
                        "export",
                        json!({ "status": outcome_label(report.success), "timeout_secs": timeout.as_secs() }),
                    );
                    (report.success, report.log)
                }
                Err(e) => {
                    let (status, log) = describe_error(&e);
                    tracing::error!(error = %e, status, "Google Sheets export failed");
                    emit_telemetry_event(
                        "export",
                        json!({ "status": status, "timeout_secs": timeout.as_secs() }),
                    );
                    (false, log)
                }
            },
        };
        record_step(StepName::Export, outcome_label(success));
        (success, log)
    }

    async fn warm_caches(&self) {
        let warmer = self.cache_warmer.clone();
        match tokio::task::spawn_blocking(move || warmer.warm()).await {
            Ok(summary) => tracing::info!(names = ?summary.names, targets = ?summary.targets, "Caches warmed"),
            Err(e) => tracing::warn!(error = %e, "Cache warm-up task failed"),
        }
    }
}

/// Run every pipeline step once. Step failures are folded into the result;
/// this never fails.
pub async fn execute_processing_pipeline(
    deps: &PipelineDeps,
    request: &PipelineRequest,
) -> PipelineResult {
    tracing::info!(filename = %request.filename, user = %request.user, "Pipeline started");

    let copy = deps.stats_copy(request).await;
    let steps = copy.steps;
    for (step, ok) in [
        (StepName::Excel, steps.excel),
        (StepName::Archive, steps.archive),
        (StepName::Sql, steps.sql),
    ] {
        record_step(step, outcome_label(ok));
    }
    let all_ok = copy.success == Some(true);
    deps.notify(
        StatusEmbed::new(
            "✅ Stats Copy Archive",
            if all_ok { COLOUR_SUCCESS } else { COLOUR_FAILURE },
        )
        .field("Excel File", tick(steps.excel), true)
        .field("Secondary Archive", tick(steps.archive), true)
        .field("SQL Procedure", tick(steps.sql), true)
        .field("Log", copy.log.clone(), false),
    )
    .await;

    if steps.sql {
        deps.rebuild_stats_cache().await;
    }

    let success_proc_import = if steps.excel {
        deps.proc_import(steps.sql).await
    } else {
        tracing::info!("Excel step failed; ProcConfig import not attempted");
        None
    };

    let (success_export, export_log) = deps.export().await;
    deps.warm_caches().await;
    deps.notify(
        StatusEmbed::new(
            "📊 Google Sheets Export",
            if success_export {
                COLOUR_SUCCESS
            } else {
                COLOUR_FAILURE
            },
        )
        .field(
            "Status",
            if success_export { "✅ Success" } else { "❌ Failure" },
            true,
        )
        .field("Log", export_log.clone(), false),
    )
    .await;

    PipelineResult {
        success_excel: steps.excel,
        success_archive: steps.archive,
        success_sql: steps.sql,
        success_export,
        success_proc_import,
        combined_log: format!("{}\n\n{}", copy.log, export_log),
    }
}

/// Runs a dequeued job to completion.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> PipelineResult;
}

/// Wraps the pipeline with start/finish embeds, live queue updates and the
/// summary audit row.
pub struct FileProcessor {
    deps: PipelineDeps,
    live_queue: Arc<LiveQueue>,
    paths: RuntimePaths,
    default_rank: Option<i64>,
    default_seed: Option<i64>,
}

impl FileProcessor {
    pub fn new(
        deps: PipelineDeps,
        live_queue: Arc<LiveQueue>,
        paths: RuntimePaths,
        default_rank: Option<i64>,
        default_seed: Option<i64>,
    ) -> Self {
        Self {
            deps,
            live_queue,
            paths,
            default_rank,
            default_seed,
        }
    }

    fn run_inputs(&self) -> RunInputs {
        load_run_inputs(
            &self.paths.cached_input_file,
            self.default_rank,
            self.default_seed,
            Utc::now().date_naive(),
        )
    }
}

fn optional(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[async_trait]
impl JobProcessor for FileProcessor {
    async fn process(&self, job: &Job) -> PipelineResult {
        let started = Utc::now();
        let clock = Instant::now();
        let user = job.user.name.as_str();

        self.deps
            .notify(
                StatusEmbed::new("📥 File Processing Started", COLOUR_INFO)
                    .field("Filename", &job.filename, true)
                    .field("User", user, true)
                    .field("Status", "Starting", true),
            )
            .await;

        let inputs = self.run_inputs();
        self.deps
            .notifier
            .send(
                Destination::User(job.user.id),
                StatusEmbed::new("🔄 Starting Script", COLOUR_INFO)
                    .field("Stage", "stats_copy_archive", true)
                    .field("Rank", optional(inputs.rank), true)
                    .field("Seed", optional(inputs.seed), true)
                    .field("Source", inputs.source.to_string(), true),
            )
            .await;

        self.live_queue.mark_processing(&job.filename, user).await;

        let request = PipelineRequest {
            rank: inputs.rank,
            seed: inputs.seed,
            filename: job.filename.clone(),
            source: Some(job.save_path.clone()),
            user: job.user.clone(),
        };
        let result = execute_processing_pipeline(&self.deps, &request).await;
        let finished = Utc::now();
        metrics::histogram!("pipeline_duration_seconds").record(clock.elapsed().as_secs_f64());

        tracing::info!(
            excel = result.success_excel,
            archive = result.success_archive,
            sql = result.success_sql,
            export = result.success_export,
            proc_import = ?result.success_proc_import,
            "Pipeline summary"
        );
        tracing::debug!(log = %result.combined_log, "Pipeline combined log");

        let summary = RunSummary {
            started,
            finished,
            filename: &job.filename,
            user,
            inputs: &inputs,
            result: &result,
        };
        if let Err(e) = append_summary(&self.paths.summary_log_file, &summary) {
            tracing::warn!(error = %e, "Failed to append summary log");
        }

        let all_ok = result.success_excel
            && result.success_archive
            && result.success_sql
            && result.success_export
            && result.success_proc_import != Some(false);
        let proc_import = match result.success_proc_import {
            Some(ok) => tick(ok),
            None => "⏭️",
        };
        self.deps
            .notify(
                StatusEmbed::new(
                    "📋 File Processing Complete",
                    if all_ok { COLOUR_SUCCESS } else { COLOUR_FAILURE },
                )
                .field("Filename", &job.filename, true)
                .field("User", user, true)
                .field("Excel", tick(result.success_excel), true)
                .field("Archive", tick(result.success_archive), true)
                .field("SQL", tick(result.success_sql), true)
                .field("Export", tick(result.success_export), true)
                .field("ProcConfig", proc_import, true)
                .field(
                    "Duration",
                    format!("{:.1}s", clock.elapsed().as_secs_f64()),
                    true,
                ),
            )
            .await;

        let icon = OutcomeIcon::from_results(result.success_archive, result.success_export);
        self.live_queue
            .finish(&job.filename, user, icon, finished)
            .await;
        tracing::info!(filename = %job.filename, icon = icon.as_str(), "File processing done");
        result
    }
}
