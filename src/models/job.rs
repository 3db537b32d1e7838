use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Discord user reference carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: u64,
    pub name: String,
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// An attachment accepted from a monitored channel, waiting to be downloaded.
#[derive(Debug, Clone)]
pub struct InboundFile {
    pub channel_id: u64,
    pub channel_name: String,
    pub message_id: u64,
    pub user: UserRef,
    /// Sanitized: never contains directory components
    pub filename: String,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
}

impl InboundFile {
    pub fn key(&self) -> JobKey {
        JobKey {
            channel_id: self.channel_id,
            filename: self.filename.clone(),
        }
    }
}

/// A downloaded file ready for the processing pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    pub channel_id: u64,
    pub channel_name: String,
    pub message_id: u64,
    pub filename: String,
    pub user: UserRef,
    pub save_path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn from_download(file: InboundFile, save_path: PathBuf) -> Self {
        Self {
            channel_id: file.channel_id,
            channel_name: file.channel_name,
            message_id: file.message_id,
            filename: file.filename,
            user: file.user,
            save_path,
            enqueued_at: file.enqueued_at,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            channel_id: self.channel_id,
            filename: self.filename.clone(),
        }
    }
}

/// Uniqueness key: at most one in-flight job per `(channel_id, filename)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub channel_id: u64,
    pub filename: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.channel_id, self.filename)
    }
}
