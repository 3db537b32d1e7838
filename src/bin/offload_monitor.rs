use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kvk_ingest::config::RuntimePaths;
use kvk_ingest::services::{
    offload::OffloadRegistry,
    offload_monitor::{monitor_loop, monitor_once, MonitorSettings, ALERT_STALE_THRESHOLD},
};
use kvk_ingest::telemetry::init_logging;

/// Sweep stale entries from the offload registry, report counters and rotate it.
#[derive(Parser, Debug)]
#[command(name = "offload-monitor", about, long_about = None, version)]
struct Args {
    /// Data directory holding offload_registry.json
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Registry file, overriding the data directory default
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Seconds between passes in loop mode
    #[arg(short, long, default_value_t = 300)]
    interval: u64,

    /// Drop entries older than this many days
    #[arg(long, default_value_t = 30)]
    rotate_days: i64,

    /// Keep at most this many entries
    #[arg(long, default_value_t = 2000)]
    max_entries: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let path = args
        .registry
        .clone()
        .unwrap_or_else(|| RuntimePaths::new(&args.data_dir).offload_registry_file);
    let registry = Arc::new(OffloadRegistry::new(path));
    let settings = MonitorSettings {
        retention_days: args.rotate_days,
        max_entries: args.max_entries,
        alert_stale_threshold: ALERT_STALE_THRESHOLD,
    };
    tracing::info!(registry = %registry.path().display(), once = args.once, "Offload monitor starting");

    if args.once {
        return match monitor_once(&registry, &settings) {
            Ok(pass) => {
                match serde_json::to_string_pretty(&pass) {
                    Ok(text) => println!("{text}"),
                    Err(e) => tracing::warn!(error = %e, "Cannot render pass summary"),
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Offload monitor pass failed");
                ExitCode::FAILURE
            }
        };
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
                shutdown.cancel();
            }
        });
    }
    monitor_loop(
        registry,
        settings,
        Duration::from_secs(args.interval.max(1)),
        shutdown,
    )
    .await;
    ExitCode::SUCCESS
}
