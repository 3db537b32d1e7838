use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use kvk_ingest::config::WatchdogConfig;
use kvk_ingest::services::{
    exit_protocol::FileExitProtocol,
    singleton_lock::SingletonLock,
    watchdog::{ProcessLauncher, Watchdog, WatchdogPolicy},
};
use kvk_ingest::telemetry::init_logging;

/// Exit code when another watchdog holds the lock.
const LOCK_CONFLICT_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match WatchdogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load watchdog configuration");
            return ExitCode::FAILURE;
        }
    };
    let paths = config.paths();
    if let Err(e) = std::fs::create_dir_all(&paths.data_dir) {
        tracing::error!(error = %e, dir = %paths.data_dir.display(), "Cannot create data directory");
        return ExitCode::FAILURE;
    }

    let _lock = match SingletonLock::acquire(&paths.watchdog_lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "Another watchdog is already running");
            return ExitCode::from(LOCK_CONFLICT_EXIT);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            tracing::error!(error = %e, "Cannot resolve working directory");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(bot = %config.bot_path.display(), pid = std::process::id(), "Watchdog started");

    let watchdog = Watchdog::new(
        Arc::new(ProcessLauncher::new(config.bot_path.clone(), cwd)),
        Arc::new(FileExitProtocol::new(&paths)),
        paths,
        WatchdogPolicy::from(&config),
        shutdown,
    );
    let report = watchdog.run().await;
    tracing::info!(stop = %report.stop, launches = report.launches(), "Watchdog exiting");
    ExitCode::SUCCESS
}

/// Cancel supervision on SIGINT or SIGTERM; the loop terminates the child.
async fn forward_signals(shutdown: CancellationToken) {
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
        _ = ctrl_c => tracing::info!("Interrupt received, stopping bot"),
        _ = terminate => tracing::info!("Terminate received, stopping bot"),
    }
    shutdown.cancel();
}
