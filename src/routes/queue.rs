use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::live_queue::LiveQueueEntry;
use crate::models::offload::OffloadStats;
use crate::services::offload_monitor::compute_stats;

#[derive(Serialize)]
pub struct LiveQueueResponse {
    pub jobs: Vec<LiveQueueEntry>,
}

/// Recent and in-flight uploads.
pub async fn live_queue(State(state): State<AppState>) -> Json<LiveQueueResponse> {
    Json(LiveQueueResponse {
        jobs: state.live_queue.snapshot().await,
    })
}

/// Offload registry counters.
pub async fn offload_stats(
    State(state): State<AppState>,
) -> Result<Json<OffloadStats>, StatusCode> {
    let registry = state.offloads.clone();
    let stats = tokio::task::spawn_blocking(move || compute_stats(&registry.entries()))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Offload stats task failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(stats))
}
