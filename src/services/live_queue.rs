use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::models::live_queue::{
    finished_status, LiveQueueEntry, OutcomeIcon, STATUS_PROCESSING, STATUS_QUEUED,
};
use crate::services::notifier::{Notifier, StatusEmbed, COLOUR_INFO};
use crate::services::storage::write_json_atomic;

/// Entries kept after each completion and shown in the embed.
pub const MAX_JOBS: usize = 5;
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    jobs: Vec<LiveQueueEntry>,
    #[serde(default)]
    message_id: Option<u64>,
}

/// Shared status display of recent and in-flight jobs, persisted to disk and
/// mirrored into an embed in the notify channel.
pub struct LiveQueue {
    state: Mutex<Snapshot>,
    path: PathBuf,
    notifier: Arc<dyn Notifier>,
    channel_id: u64,
}

impl LiveQueue {
    /// Restore from `path`; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>, notifier: Arc<dyn Notifier>, channel_id: u64) -> Self {
        let path = path.into();
        let snapshot = std::fs::read(&path)
            .ok()
            .and_then(|bytes| match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable live queue file");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            state: Mutex::new(snapshot),
            path,
            notifier,
            channel_id,
        }
    }

    pub async fn snapshot(&self) -> Vec<LiveQueueEntry> {
        self.state.lock().await.jobs.clone()
    }

    fn persist(&self, snapshot: &Snapshot) {
        if let Err(e) = write_json_atomic(&self.path, snapshot) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist live queue");
        }
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<LiveQueueEntry>) -> R) -> R {
        let mut state = self.state.lock().await;
        let result = f(&mut state.jobs);
        self.persist(&state);
        result
    }

    pub async fn enqueue(&self, entry: LiveQueueEntry) {
        self.mutate(|jobs| jobs.push(entry)).await;
        self.refresh().await;
    }

    /// Set the newest unfinished entry for `filename` + `user` to processing.
    pub async fn mark_processing(&self, filename: &str, user: &str) -> bool {
        let updated = self
            .mutate(|jobs| match find_open(jobs, filename, user) {
                Some(entry) => {
                    entry.status = STATUS_PROCESSING.to_string();
                    true
                }
                None => false,
            })
            .await;
        self.refresh().await;
        updated
    }

    /// Record the terminal icon and keep only the latest [`MAX_JOBS`] entries.
    pub async fn finish(&self, filename: &str, user: &str, icon: OutcomeIcon, at: DateTime<Utc>) {
        self.mutate(|jobs| {
            if let Some(entry) = find_open(jobs, filename, user) {
                entry.status = finished_status(icon, at);
            }
            trim(jobs);
        })
        .await;
        self.refresh().await;
    }

    /// Drop finished entries uploaded more than `retention` ago.
    pub async fn cleanup_expired(&self, retention: ChronoDuration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let removed = self
            .mutate(|jobs| {
                let before = jobs.len();
                jobs.retain(|entry| {
                    !(entry.is_finished() && entry.uploaded_at().is_some_and(|at| at < cutoff))
                });
                before - jobs.len()
            })
            .await;
        if removed > 0 {
            tracing::info!(removed, "Purged expired live queue entries");
            self.refresh().await;
        }
        removed
    }

    /// Re-render the status embed, editing the previous message when possible.
    pub async fn refresh(&self) {
        let (jobs, message_id) = {
            let state = self.state.lock().await;
            (state.jobs.clone(), state.message_id)
        };
        let posted = self
            .notifier
            .upsert(self.channel_id, message_id, render_embed(&jobs))
            .await;
        if posted != message_id {
            let mut state = self.state.lock().await;
            state.message_id = posted;
            self.persist(&state);
        }
    }

    pub async fn cleanup_loop(
        self: Arc<Self>,
        retention: ChronoDuration,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
            }
            self.cleanup_expired(retention, Utc::now()).await;
        }
    }
}

fn find_open<'a>(
    jobs: &'a mut [LiveQueueEntry],
    filename: &str,
    user: &str,
) -> Option<&'a mut LiveQueueEntry> {
    jobs.iter_mut()
        .rev()
        .find(|e| e.filename == filename && e.user == user && !e.is_finished())
}

fn trim(jobs: &mut Vec<LiveQueueEntry>) {
    if jobs.len() > MAX_JOBS {
        jobs.drain(..jobs.len() - MAX_JOBS);
    }
}

fn status_rank(status: &str) -> u8 {
    if status == STATUS_QUEUED {
        0
    } else if status == STATUS_PROCESSING {
        1
    } else {
        2
    }
}

pub fn render_embed(jobs: &[LiveQueueEntry]) -> StatusEmbed {
    let mut embed =
        StatusEmbed::new("📊 Live Processing Queue", COLOUR_INFO).footer("Tracking latest 5 jobs");
    let start = jobs.len().saturating_sub(MAX_JOBS);
    let mut shown: Vec<&LiveQueueEntry> = jobs[start..].iter().collect();
    if shown.is_empty() {
        return embed.description("✅ No files currently in queue.");
    }
    shown.sort_by(|a, b| {
        (status_rank(&a.status), &a.filename).cmp(&(status_rank(&b.status), &b.filename))
    });
    for job in shown {
        let uploaded: String = job.uploaded.chars().take(16).collect::<String>().replace('T', " ");
        embed = embed.field(
            format!("📄 {}", job.filename),
            format!(
                "👤 {}\n📅 {} UTC\n📣 #{}\n{}",
                job.user, uploaded, job.channel, job.status
            ),
            false,
        );
    }
    embed
}
