pub mod handler;

use serenity::all::{Client, GatewayIntents};

use crate::app_state::AppState;
pub use handler::Handler;

/// Connect to the gateway and dispatch events until `state.shutdown` fires.
pub async fn start_bot(token: &str, state: AppState) -> Result<(), serenity::Error> {
    // MESSAGE_CONTENT is privileged and must be enabled in the developer portal
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let shutdown = state.shutdown.clone();
    let mut client = Client::builder(token, intents)
        .event_handler(Handler::new(state))
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        tracing::info!("Shutting down Discord shards");
        shard_manager.shutdown_all().await;
    });

    tracing::info!("Starting Discord bot");
    client.start().await
}
