use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Maximum characters kept from free-form output fields.
pub const MAX_SNIPPET: usize = 2000;

/// Initialize structured JSON logging, honouring `RUST_LOG`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Emit a structured telemetry event on the `telemetry` target.
///
/// The payload is logged as a JSON string so downstream collectors can parse
/// it without depending on the subscriber's field layout.
pub fn emit_telemetry_event(event: &str, payload: Value) {
    let mut payload = payload;
    if let Value::Object(map) = &mut payload {
        map.insert("event".to_string(), Value::String(event.to_string()));
        map.entry("timestamp")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
    }
    tracing::info!(target: "telemetry", event, payload = %payload, "telemetry");
}

/// Truncate `text` to at most `max_chars` characters.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

/// Register descriptions for every metric the bot records.
pub fn describe_metrics() {
    metrics::describe_counter!("jobs_enqueued_total", "Uploads accepted into a channel queue");
    metrics::describe_counter!("jobs_dropped_total", "Uploads dropped because the channel queue was full");
    metrics::describe_counter!(
        "jobs_duplicate_total",
        "Uploads skipped because the same file was already in flight"
    );
    metrics::describe_counter!("jobs_panicked_total", "Queue iterations that panicked");
    metrics::describe_gauge!("queue_depth", "Pending uploads per channel queue");
    metrics::describe_counter!("pipeline_steps_total", "Pipeline step outcomes by step");
    metrics::describe_histogram!(
        "pipeline_duration_seconds",
        "Wall time of one file processing run"
    );
    metrics::describe_counter!("offload_timeouts_total", "Offloaded operations that timed out");
    metrics::describe_gauge!("offload_registry_active", "Unfinished offload registry entries");
    metrics::describe_gauge!("offload_registry_total", "Offload registry entries");
}
