use async_trait::async_trait;
use serenity::all::{
    ChannelId, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage, Http, MessageId,
    Timestamp, UserId,
};
use std::sync::{Arc, Mutex};

use crate::telemetry::snippet;

pub const COLOUR_INFO: u32 = 0x3498DB;
pub const COLOUR_SUCCESS: u32 = 0x2ECC71;
pub const COLOUR_FAILURE: u32 = 0xE74C3C;
pub const COLOUR_RUNNING: u32 = 0xF1C40F;

const FIELD_MAX: usize = 1024;
const TITLE_MAX: usize = 256;
const DESCRIPTION_MAX: usize = 4096;

/// Where an embed is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Channel(u64),
    User(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Transport-neutral embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEmbed {
    pub title: String,
    pub description: Option<String>,
    pub fields: Vec<EmbedField>,
    pub colour: u32,
    pub footer: Option<String>,
}

impl StatusEmbed {
    pub fn new(title: impl Into<String>, colour: u32) -> Self {
        Self {
            title: title.into(),
            description: None,
            fields: Vec::new(),
            colour,
            footer: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(text.into());
        self
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// Serenity builder with every part clipped to Discord's limits.
    pub fn to_create_embed(&self) -> CreateEmbed {
        let mut embed = CreateEmbed::new()
            .title(snippet(&self.title, TITLE_MAX))
            .colour(self.colour)
            .timestamp(Timestamp::now());
        if let Some(description) = &self.description {
            embed = embed.description(snippet(description, DESCRIPTION_MAX));
        }
        for field in &self.fields {
            let value = if field.value.is_empty() {
                "-".to_string()
            } else {
                clip(&field.value, FIELD_MAX)
            };
            embed = embed.field(snippet(&field.name, TITLE_MAX), value, field.inline);
        }
        if let Some(footer) = &self.footer {
            embed = embed.footer(CreateEmbedFooter::new(footer));
        }
        embed
    }
}

/// Keep the tail of long values (logs end with the interesting part).
fn clip(value: &str, max: usize) -> String {
    let count = value.chars().count();
    if count <= max {
        return value.to_string();
    }
    let tail: String = value.chars().skip(count - (max - 1)).collect();
    format!("…{tail}")
}

/// Delivers status embeds. Delivery is best-effort and never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns the posted message id, `None` when delivery failed.
    async fn send(&self, to: Destination, embed: StatusEmbed) -> Option<u64>;

    /// Edit `message_id` in place, posting a fresh message when the edit fails.
    async fn upsert(&self, channel_id: u64, message_id: Option<u64>, embed: StatusEmbed) -> Option<u64>;

    /// Per-step progress embed for the uploader.
    async fn step(&self, user_id: u64, title: &str, status: &str) {
        let embed = StatusEmbed::new(title, COLOUR_INFO).field("Status", status, false);
        self.send(Destination::User(user_id), embed).await;
    }
}

/// Discord delivery over the REST API.
pub struct DiscordNotifier {
    http: Arc<Http>,
    fallback_channel: u64,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>, fallback_channel: u64) -> Self {
        Self {
            http,
            fallback_channel,
        }
    }

    async fn post(&self, to: Destination, embed: &StatusEmbed) -> serenity::Result<u64> {
        let message = CreateMessage::new().embed(embed.to_create_embed());
        let posted = match to {
            Destination::Channel(id) => ChannelId::new(id).send_message(&self.http, message).await?,
            Destination::User(id) => UserId::new(id).direct_message(&self.http, message).await?,
        };
        Ok(posted.id.get())
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, to: Destination, embed: StatusEmbed) -> Option<u64> {
        match self.post(to, &embed).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(destination = ?to, title = %embed.title, error = %e, "Embed delivery failed");
                if matches!(to, Destination::User(_)) {
                    let notice = StatusEmbed::new("Embed Delivery Failed", COLOUR_FAILURE)
                        .field("Title", &embed.title, false)
                        .field("Error", e.to_string(), false);
                    if let Err(e) = self
                        .post(Destination::Channel(self.fallback_channel), &notice)
                        .await
                    {
                        tracing::error!(error = %e, "Fallback embed delivery failed");
                    }
                }
                None
            }
        }
    }

    async fn upsert(&self, channel_id: u64, message_id: Option<u64>, embed: StatusEmbed) -> Option<u64> {
        if let Some(message_id) = message_id {
            let edit = EditMessage::new().embed(embed.to_create_embed());
            match self
                .http
                .edit_message(ChannelId::new(channel_id), MessageId::new(message_id), &edit, vec![])
                .await
            {
                Ok(_) => return Some(message_id),
                Err(e) => {
                    tracing::info!(channel_id, message_id, error = %e, "Could not edit embed, posting a new one");
                }
            }
        }
        self.send(Destination::Channel(channel_id), embed).await
    }
}

/// Collects embeds in memory instead of delivering them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Destination, StatusEmbed)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Destination, StatusEmbed)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn titles(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, e)| e.title).collect()
    }

    fn record(&self, to: Destination, embed: StatusEmbed) -> u64 {
        match self.sent.lock() {
            Ok(mut sent) => {
                sent.push((to, embed));
                sent.len() as u64
            }
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: Destination, embed: StatusEmbed) -> Option<u64> {
        Some(self.record(to, embed))
    }

    async fn upsert(&self, channel_id: u64, message_id: Option<u64>, embed: StatusEmbed) -> Option<u64> {
        let id = self.record(Destination::Channel(channel_id), embed);
        message_id.or(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_keeps_tail() {
        let long = "x".repeat(2000) + "END";
        let clipped = clip(&long, FIELD_MAX);
        assert_eq!(clipped.chars().count(), FIELD_MAX);
        assert!(clipped.starts_with('…'));
        assert!(clipped.ends_with("END"));
        assert_eq!(clip("short", FIELD_MAX), "short");
    }

    #[test]
    fn test_embed_builder() {
        let embed = StatusEmbed::new("📥 File Processing Started", COLOUR_INFO)
            .field("Filename", "stats.xlsx", true)
            .field("User", "bob", true);
        assert_eq!(embed.field_value("User"), Some("bob"));
        assert_eq!(embed.field_value("Status"), None);
    }

    #[tokio::test]
    async fn test_recording_notifier_step() {
        let notifier = RecordingNotifier::new();
        notifier.step(7, "Processing Excel File", "⏳ Running...").await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Destination::User(7));
        assert_eq!(sent[0].1.field_value("Status"), Some("⏳ Running..."));
    }
}
