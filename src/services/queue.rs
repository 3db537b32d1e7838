use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::models::job::{InboundFile, Job, JobKey};
use crate::models::live_queue::{LiveQueueEntry, OutcomeIcon};
use crate::services::live_queue::LiveQueue;
use crate::services::notifier::{Destination, Notifier, StatusEmbed, COLOUR_FAILURE};
use crate::services::pipeline::JobProcessor;
use crate::services::storage::{
    append_csv_row, download_with_retries, sanitize_filename, AttachmentFetcher,
};

/// Keys of jobs that are queued or running. At most one per `(channel, filename)`.
#[derive(Debug, Clone, Default)]
pub struct ActiveJobs {
    keys: Arc<Mutex<HashSet<JobKey>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert under one lock. `None` when the key is already held.
    pub fn try_claim(&self, key: JobKey) -> Option<JobClaim> {
        let mut keys = self.keys.lock().ok()?;
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(JobClaim {
            key,
            keys: self.keys.clone(),
        })
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.keys.lock().map(|k| k.contains(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key when dropped, whichever way the job ends.
#[derive(Debug)]
pub struct JobClaim {
    key: JobKey,
    keys: Arc<Mutex<HashSet<JobKey>>>,
}

impl JobClaim {
    pub fn key(&self) -> &JobKey {
        &self.key
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(&self.key);
        }
    }
}

/// Process-wide lock: one pipeline run at a time across all channels.
#[derive(Debug, Default)]
pub struct ProcessingLock {
    inner: AsyncMutex<()>,
}

impl ProcessingLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// An accepted upload travelling through its channel queue with its claim.
#[derive(Debug)]
pub struct QueuedFile {
    pub file: InboundFile,
    pub claim: JobClaim,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
    Full,
    UnknownChannel,
}

/// Bounded FIFO queues, one per monitored channel.
pub struct ChannelQueues {
    senders: HashMap<u64, mpsc::Sender<QueuedFile>>,
    active: ActiveJobs,
}

/// Receiving half handed to a channel's worker.
pub type ChannelReceiver = mpsc::Receiver<QueuedFile>;

impl ChannelQueues {
    pub fn new(
        channel_ids: &[u64],
        capacity: usize,
        active: ActiveJobs,
    ) -> (Self, Vec<(u64, ChannelReceiver)>) {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for &channel_id in channel_ids {
            if senders.contains_key(&channel_id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(channel_id, tx);
            receivers.push((channel_id, rx));
        }
        (Self { senders, active }, receivers)
    }

    pub fn is_monitored(&self, channel_id: u64) -> bool {
        self.senders.contains_key(&channel_id)
    }

    pub fn active(&self) -> &ActiveJobs {
        &self.active
    }

    /// Claim the job key and enqueue without waiting.
    pub fn try_enqueue(&self, file: InboundFile) -> EnqueueOutcome {
        let Some(sender) = self.senders.get(&file.channel_id) else {
            return EnqueueOutcome::UnknownChannel;
        };
        let channel = file.channel_id.to_string();
        let Some(claim) = self.active.try_claim(file.key()) else {
            tracing::info!(key = %file.key(), user = %file.user, "Duplicate job skipped");
            metrics::counter!("jobs_duplicate_total", "channel" => channel).increment(1);
            return EnqueueOutcome::Duplicate;
        };
        match sender.try_send(QueuedFile { file, claim }) {
            Ok(()) => {
                metrics::counter!("jobs_enqueued_total", "channel" => channel.clone()).increment(1);
                metrics::gauge!("queue_depth", "channel" => channel).set(depth(sender) as f64);
                EnqueueOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                tracing::warn!(key = %item.file.key(), "Channel queue full, dropping upload");
                metrics::counter!("jobs_dropped_total", "channel" => channel).increment(1);
                EnqueueOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                tracing::warn!(key = %item.file.key(), "Channel worker stopped, dropping upload");
                metrics::counter!("jobs_dropped_total", "channel" => channel).increment(1);
                EnqueueOutcome::Full
            }
        }
    }

    /// Pending items per channel, sorted by channel id.
    pub fn depths(&self) -> Vec<(u64, usize)> {
        let mut depths: Vec<(u64, usize)> = self
            .senders
            .iter()
            .map(|(id, sender)| (*id, depth(sender)))
            .collect();
        depths.sort_unstable();
        depths
    }
}

fn depth(sender: &mpsc::Sender<QueuedFile>) -> usize {
    sender.max_capacity() - sender.capacity()
}

/// Enqueue an upload and add its live queue entry when accepted.
pub async fn submit(
    queues: &ChannelQueues,
    live_queue: &LiveQueue,
    file: InboundFile,
) -> EnqueueOutcome {
    let entry = LiveQueueEntry::queued(
        &file.filename,
        &file.user.name,
        &file.channel_name,
        file.enqueued_at,
    );
    let outcome = queues.try_enqueue(file);
    if outcome == EnqueueOutcome::Queued {
        live_queue.enqueue(entry).await;
    }
    outcome
}

pub const DOWNLOAD_LOG_HEADER: [&str; 5] = ["timestamp", "channel", "filename", "user", "save_path"];

/// Everything a channel worker needs besides its receiver.
pub struct WorkerContext {
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub processor: Arc<dyn JobProcessor>,
    pub lock: Arc<ProcessingLock>,
    pub notifier: Arc<dyn Notifier>,
    pub live_queue: Arc<LiveQueue>,
    pub download_folder: PathBuf,
    pub download_log: PathBuf,
    pub notify_channel_id: u64,
    pub download_attempts: u32,
    pub retry_delay: Duration,
}

impl WorkerContext {
    async fn handle(&self, item: QueuedFile) {
        let QueuedFile { file, claim } = item;
        let save_path = self.download_folder.join(sanitize_filename(&file.filename));

        if let Err(e) = download_with_retries(
            self.fetcher.as_ref(),
            &file.url,
            &save_path,
            self.download_attempts,
            self.retry_delay,
        )
        .await
        {
            tracing::error!(key = %claim.key(), error = %e, "Download failed after retries");
            self.notifier
                .send(
                    Destination::Channel(self.notify_channel_id),
                    StatusEmbed::new("❌ Download Failed", COLOUR_FAILURE)
                        .field("File", &file.filename, true)
                        .field("User", &file.user.name, true)
                        .field("Channel", format!("#{}", file.channel_name), true)
                        .field(
                            "Status",
                            format!("Failed after {} attempts", self.download_attempts),
                            false,
                        ),
                )
                .await;
            self.live_queue
                .finish(&file.filename, &file.user.name, OutcomeIcon::Red, Utc::now())
                .await;
            return;
        }

        let row = [
            Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            file.channel_name.clone(),
            file.filename.clone(),
            file.user.name.clone(),
            save_path.display().to_string(),
        ];
        if let Err(e) = append_csv_row(&self.download_log, &DOWNLOAD_LOG_HEADER, &row) {
            tracing::warn!(error = %e, "Failed to append download log");
        }
        tracing::info!(key = %claim.key(), path = %save_path.display(), "Attachment saved");

        let job = Job::from_download(file, save_path);
        let _guard = self.lock.acquire().await;
        tracing::info!(key = %claim.key(), "Processing lock acquired");
        self.processor.process(&job).await;
        drop(claim);
    }
}

/// Drain one channel's queue in order until cancelled or the queue closes.
/// A panic inside one job is logged and the loop moves on.
pub async fn queue_worker(
    channel_id: u64,
    mut rx: ChannelReceiver,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) {
    tracing::info!(channel_id, "Queue worker started");
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        metrics::gauge!("queue_depth", "channel" => channel_id.to_string()).set(rx.len() as f64);
        let key = item.claim.key().clone();

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::warn!(channel_id, key = %key, "Worker cancelled mid-job");
                break;
            }
            outcome = AssertUnwindSafe(ctx.handle(item)).catch_unwind() => {
                if outcome.is_err() {
                    tracing::error!(channel_id, key = %key, "Job panicked; continuing with next upload");
                    metrics::counter!("jobs_panicked_total").increment(1);
                }
            }
        }
    }
    tracing::info!(channel_id, "Queue worker stopped");
}
