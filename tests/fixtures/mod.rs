//! Builders for uploads and runtime directories used across scenarios

#![allow(dead_code)]

use chrono::Utc;
use kvk_ingest::config::RuntimePaths;
use kvk_ingest::models::job::{InboundFile, UserRef};
use std::path::Path;

pub const UPLOAD_CHANNEL: u64 = 1001;
pub const SECOND_CHANNEL: u64 = 1002;
pub const NOTIFY_CHANNEL: u64 = 2000;

pub fn uploader() -> UserRef {
    UserRef {
        id: 77,
        name: "bob".to_string(),
    }
}

pub fn inbound(channel_id: u64, filename: &str) -> InboundFile {
    InboundFile {
        channel_id,
        channel_name: format!("uploads-{channel_id}"),
        message_id: 1,
        user: uploader(),
        filename: filename.to_string(),
        url: format!("https://cdn.example/{channel_id}/{filename}"),
        enqueued_at: Utc::now(),
    }
}

pub fn runtime_paths(dir: &Path) -> RuntimePaths {
    RuntimePaths::new(&dir.join("data"))
}
