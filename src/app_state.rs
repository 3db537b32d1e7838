use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, RuntimePaths};
use crate::services::{
    collaborators::{CacheWarmer, CommandStep, SqlStepSettings, StatsCopySteps},
    database::{SqlSettings, SqlcmdDatabase, StatsDatabase},
    exit_protocol::{ExitProtocol, FileExitProtocol},
    headroom::LogHeadroomPreflight,
    live_queue::LiveQueue,
    notifier::Notifier,
    offload::{OffloadRegistry, OffloadRunner},
    pipeline::{FileProcessor, JobProcessor, PipelineDeps, PipelineTimeouts},
    queue::{ActiveJobs, ChannelQueues, ChannelReceiver, ProcessingLock, WorkerContext},
    storage::{AttachmentFetcher, DOWNLOAD_ATTEMPTS, DOWNLOAD_RETRY_DELAY},
};

/// Shared application state passed to route handlers, the Discord handler and
/// the background loops.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub paths: RuntimePaths,
    pub queues: Arc<ChannelQueues>,
    pub live_queue: Arc<LiveQueue>,
    pub processing_lock: Arc<ProcessingLock>,
    pub offloads: Arc<OffloadRegistry>,
    pub exit: Arc<dyn ExitProtocol>,
    pub shutdown: CancellationToken,
    exit_code: Arc<AtomicI32>,
    started_at: Instant,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record the process exit code and begin shutdown.
    pub fn request_exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

/// State plus the pieces `main` hands to the channel workers.
pub struct Runtime {
    pub state: AppState,
    pub receivers: Vec<(u64, ChannelReceiver)>,
    pub worker: Arc<WorkerContext>,
}

impl Runtime {
    /// Wire the production services around the given delivery and download
    /// transports.
    pub fn build(
        config: AppConfig,
        notifier: Arc<dyn Notifier>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> Self {
        let paths = config.paths();
        let offloads = Arc::new(OffloadRegistry::new(&paths.offload_registry_file));
        let runner = OffloadRunner::new(offloads.clone());
        let db: Arc<dyn StatsDatabase> = Arc::new(SqlcmdDatabase::new(
            SqlSettings::from(&config),
            runner.clone(),
        ));

        let deps = PipelineDeps {
            notifier: notifier.clone(),
            stats_copy: Arc::new(StatsCopySteps::new(
                config.download_folder.clone(),
                db.clone(),
                runner.clone(),
                SqlStepSettings::from(&config),
            )),
            stats_cache: CommandStep::from_config(
                "build_player_stats_cache",
                config.stats_cache_command.as_deref(),
                &runner,
            ),
            last_kvk_cache: CommandStep::from_config(
                "build_lastkvk_cache",
                config.last_kvk_cache_command.as_deref(),
                &runner,
            ),
            headroom: Arc::new(LogHeadroomPreflight::new(db, (&config).into())),
            proc_import: CommandStep::from_config(
                "proc_import",
                config.proc_import_command.as_deref(),
                &runner,
            ),
            export: CommandStep::from_config(
                "export_to_sheets",
                config.export_command.as_deref(),
                &runner,
            ),
            cache_warmer: Arc::new(CacheWarmer::new(
                paths.name_cache_file.clone(),
                paths.target_cache_file.clone(),
            )),
            timeouts: PipelineTimeouts::from(&config),
            notify_channel_id: config.notify_channel_id,
        };

        let live_queue = Arc::new(LiveQueue::load(
            &paths.live_queue_file,
            notifier.clone(),
            config.notify_channel_id,
        ));
        let processor: Arc<dyn JobProcessor> = Arc::new(FileProcessor::new(
            deps,
            live_queue.clone(),
            paths.clone(),
            config.rank,
            config.seed,
        ));
        let (queues, receivers) =
            ChannelQueues::new(&config.channel_ids, config.queue_capacity, ActiveJobs::new());
        let processing_lock = Arc::new(ProcessingLock::new());

        let worker = Arc::new(WorkerContext {
            fetcher,
            processor,
            lock: processing_lock.clone(),
            notifier,
            live_queue: live_queue.clone(),
            download_folder: config.download_folder.clone(),
            download_log: paths.download_log_file.clone(),
            notify_channel_id: config.notify_channel_id,
            download_attempts: DOWNLOAD_ATTEMPTS,
            retry_delay: DOWNLOAD_RETRY_DELAY,
        });

        let state = AppState {
            exit: Arc::new(FileExitProtocol::new(&paths)),
            config: Arc::new(config),
            paths,
            queues: Arc::new(queues),
            live_queue,
            processing_lock,
            offloads,
            shutdown: CancellationToken::new(),
            exit_code: Arc::new(AtomicI32::new(0)),
            started_at: Instant::now(),
        };

        Self {
            state,
            receivers,
            worker,
        }
    }
}
