use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serenity::all::Http;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use kvk_ingest::app_state::{AppState, Runtime};
use kvk_ingest::bot;
use kvk_ingest::config::AppConfig;
use kvk_ingest::routes;
use kvk_ingest::services::{
    exit_protocol::{remove_pid_file_if_owned, write_pid_file},
    live_queue::CLEANUP_INTERVAL,
    notifier::{DiscordNotifier, Notifier},
    offload_monitor::{monitor_loop, MonitorSettings, ALERT_STALE_THRESHOLD},
    queue::queue_worker,
    singleton_lock::SingletonLock,
    storage::HttpFetcher,
};
use kvk_ingest::telemetry::{describe_metrics, init_logging};

/// Exit code when another bot instance holds the lock.
const LOCK_CONFLICT_EXIT: u8 = 2;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration from environment");
            return ExitCode::FAILURE;
        }
    };
    let paths = config.paths();
    if let Err(e) = std::fs::create_dir_all(&paths.data_dir) {
        tracing::error!(error = %e, dir = %paths.data_dir.display(), "Cannot create data directory");
        return ExitCode::FAILURE;
    }

    let _lock = match SingletonLock::acquire(&paths.bot_lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "Another bot instance is already running");
            return ExitCode::from(LOCK_CONFLICT_EXIT);
        }
    };
    let pid = std::process::id();
    if let Err(e) = write_pid_file(&paths.bot_pid_file, pid) {
        tracing::warn!(error = %e, "Failed to write bot PID file");
    }

    tracing::info!(pid, channels = ?config.channel_ids, "Initializing kvk-ingest");

    let prometheus_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus metrics recorder");
            return ExitCode::FAILURE;
        }
    };
    describe_metrics();

    let fetcher = match HttpFetcher::new() {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };
    let http = Arc::new(Http::new(&config.discord_token));
    let notifier: Arc<dyn Notifier> =
        Arc::new(DiscordNotifier::new(http, config.notify_channel_id));

    let Runtime {
        state,
        receivers,
        worker,
    } = Runtime::build(config, notifier, fetcher);

    let tracker = TaskTracker::new();
    for (channel_id, rx) in receivers {
        tracker.spawn(queue_worker(
            channel_id,
            rx,
            worker.clone(),
            state.shutdown.clone(),
        ));
    }
    tracker.spawn(state.live_queue.clone().cleanup_loop(
        chrono::Duration::days(state.config.live_queue_retention_days),
        CLEANUP_INTERVAL,
        state.shutdown.clone(),
    ));
    tracker.spawn(monitor_loop(
        state.offloads.clone(),
        MonitorSettings {
            retention_days: state.config.offload_retention_days,
            max_entries: state.config.offload_max_entries,
            alert_stale_threshold: ALERT_STALE_THRESHOLD,
        },
        Duration::from_secs(state.config.offload_monitor_interval_secs),
        state.shutdown.clone(),
    ));
    {
        let live_queue = state.live_queue.clone();
        tracker.spawn(async move { live_queue.refresh().await });
    }
    tracker.spawn(wait_for_signal(state.clone()));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/queue", get(routes::queue::live_queue))
        .route("/api/v1/offloads", get(routes::queue::offload_stats))
        .with_state(state.clone())
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(&state.config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %state.config.bind_addr, "Failed to bind status server");
            state.request_exit(1);
            return finish(&state, tracker, pid).await;
        }
    };
    tracing::info!(addr = %state.config.bind_addr, "Status server listening");
    {
        let shutdown = state.shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Status server error");
            }
        });
    }

    let token = state.config.discord_token.clone();
    if let Err(e) = bot::start_bot(&token, state.clone()).await {
        tracing::error!(error = %e, "Discord client stopped with an error");
        if !state.shutdown.is_cancelled() {
            state.request_exit(1);
        }
    }
    // The gateway can also return cleanly on its own
    state.shutdown.cancel();

    finish(&state, tracker, pid).await
}

/// Cancel on SIGINT / SIGTERM with a clean exit code.
async fn wait_for_signal(state: AppState) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Interrupt received"),
        _ = terminate => tracing::info!("Terminate received"),
        _ = state.shutdown.cancelled() => return,
    }
    state.request_exit(0);
}

/// Drain background tasks, record the exit code for the watchdog and clean
/// up the PID file.
async fn finish(state: &AppState, tracker: TaskTracker, pid: u32) -> ExitCode {
    state.shutdown.cancel();
    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        tracing::warn!("Background tasks did not stop in time");
    }

    let code = state.exit_code();
    if let Err(e) = state.exit.write_exit_code(code) {
        tracing::warn!(error = %e, "Failed to write exit code file");
    }
    remove_pid_file_if_owned(&state.paths.bot_pid_file, pid);
    tracing::info!(code, "kvk-ingest stopped");
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
