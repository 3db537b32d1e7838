use chrono::Utc;
use serenity::all::{Context, EventHandler, Message, Ready};
use serenity::async_trait;

use crate::app_state::AppState;
use crate::models::exit::{RestartFlag, RESTART_EXIT_CODE};
use crate::models::job::{InboundFile, UserRef};
use crate::services::exit_protocol::ExitProtocolError;
use crate::services::queue::{submit, EnqueueOutcome};
use crate::services::storage::sanitize_filename;

const UPLOAD_EXTENSIONS: [&str; 3] = [".xlsx", ".xls", ".csv"];

/// Whether an attachment name is a stats upload for the pipeline.
pub fn is_supported_upload(filename: &str) -> bool {
    let lower = filename.trim().to_lowercase();
    UPLOAD_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Admin text commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Restart { reason: String },
    Shutdown { reason: String },
}

pub fn parse_admin_command(content: &str) -> Option<AdminCommand> {
    let mut parts = content.trim().splitn(2, char::is_whitespace);
    let command = parts.next()?;
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("no reason given")
        .to_string();
    match command {
        "!restart" => Some(AdminCommand::Restart { reason }),
        "!shutdown" => Some(AdminCommand::Shutdown { reason }),
        _ => None,
    }
}

/// Discord gateway event handler.
pub struct Handler {
    state: AppState,
}

impl Handler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Write the exit protocol files, then start shutdown with `code`.
    fn run_admin_command(&self, user_id: u64, command: &AdminCommand) -> Result<i32, ExitProtocolError> {
        let exit = &self.state.exit;
        let code = match command {
            AdminCommand::Restart { reason } => {
                exit.write_restart_flag(&RestartFlag::new(user_id, reason))?;
                RESTART_EXIT_CODE
            }
            AdminCommand::Shutdown { reason } => {
                exit.write_shutdown_marker(reason)?;
                0
            }
        };
        exit.write_exit_code(code)?;
        self.state.request_exit(code);
        Ok(code)
    }

    async fn enqueue_uploads(&self, ctx: &Context, msg: &Message) {
        let channel_id = msg.channel_id.get();
        let channel_name = msg
            .channel_id
            .name(ctx)
            .await
            .unwrap_or_else(|_| channel_id.to_string());
        let user = UserRef {
            id: msg.author.id.get(),
            name: msg.author.name.clone(),
        };

        for attachment in &msg.attachments {
            tracing::info!(channel_id, filename = %attachment.filename, "Attachment received");
            if !is_supported_upload(&attachment.filename) {
                continue;
            }
            let file = InboundFile {
                channel_id,
                channel_name: channel_name.clone(),
                message_id: msg.id.get(),
                user: user.clone(),
                filename: sanitize_filename(&attachment.filename),
                url: attachment.url.clone(),
                enqueued_at: Utc::now(),
            };
            match submit(&self.state.queues, &self.state.live_queue, file).await {
                EnqueueOutcome::Queued => {
                    tracing::info!(channel_id, message_id = msg.id.get(), "Upload queued for worker")
                }
                outcome => {
                    tracing::warn!(channel_id, message_id = msg.id.get(), ?outcome, "Upload not queued")
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Connected to Discord");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        if let Some(command) = parse_admin_command(&msg.content) {
            let user_id = msg.author.id.get();
            if user_id != self.state.config.admin_user_id {
                tracing::warn!(user_id, ?command, "Ignoring admin command from non-admin");
                return;
            }
            let reply = match self.run_admin_command(user_id, &command) {
                Ok(code) => {
                    tracing::warn!(?command, code, "Admin requested exit");
                    format!("Exiting with code {code}.")
                }
                Err(e) => {
                    tracing::error!(error = %e, ?command, "Failed to write exit protocol files");
                    format!("Could not record the request: {e}")
                }
            };
            if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
                tracing::warn!(error = %e, "Failed to acknowledge admin command");
            }
            return;
        }

        if self.state.queues.is_monitored(msg.channel_id.get()) && !msg.attachments.is_empty() {
            self.enqueue_uploads(&ctx, &msg).await;
        }
    }
}
