use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queues: Vec<QueueDepth>,
    pub active_jobs: usize,
    pub processing: bool,
    pub shutting_down: bool,
}

#[derive(Serialize)]
pub struct QueueDepth {
    pub channel_id: u64,
    pub pending: usize,
}

/// Process liveness plus queue and lock state.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let shutting_down = state.shutdown.is_cancelled();
    let status_code = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status: if shutting_down { "stopping" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime().as_secs(),
        queues: state
            .queues
            .depths()
            .into_iter()
            .map(|(channel_id, pending)| QueueDepth {
                channel_id,
                pending,
            })
            .collect(),
        active_jobs: state.queues.active().len(),
        processing: state.processing_lock.is_held(),
        shutting_down,
    };

    (status_code, Json(response))
}
