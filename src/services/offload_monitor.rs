use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::offload::{
    OffloadRegistryEntry, OffloadStats, OffloadStatus, RotationSummary, StaleMarked,
};
use crate::services::offload::{OffloadRegistry, RegistryError};
use crate::services::process::pid_alive;
use crate::telemetry::emit_telemetry_event;

pub const STALE_NOTE_PREFIX: &str = "marked_stale";
pub const ALERT_STALE_THRESHOLD: usize = 5;

/// Sweep and rotation settings.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub retention_days: i64,
    pub max_entries: usize,
    pub alert_stale_threshold: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_entries: 2000,
            alert_stale_threshold: ALERT_STALE_THRESHOLD,
        }
    }
}

/// Counts over registry entries. Unfinished entries with a dead pid are stale.
pub fn compute_stats(entries: &[OffloadRegistryEntry]) -> OffloadStats {
    let mut stats = OffloadStats {
        total: entries.len(),
        ..OffloadStats::default()
    };
    for entry in entries {
        if entry.is_completed() {
            stats.completed += 1;
        } else {
            match entry.pid {
                Some(pid) if !pid_alive(pid) => stats.stale += 1,
                _ => stats.active += 1,
            }
        }
        if entry.cancel_requested {
            stats.cancel_requested += 1;
            if entry.ok == Some(false) {
                stats.cancel_failed += 1;
            }
        }
        if entry.timed_out() {
            stats.timeouts += 1;
        }
    }
    stats
}

/// Complete every unfinished entry whose pid is no longer alive.
pub fn check_and_mark_stale(registry: &OffloadRegistry) -> Result<Vec<StaleMarked>, RegistryError> {
    let marked = registry.mutate(|entries| {
        let mut marked = Vec::new();
        for entry in entries.values_mut() {
            if entry.status == OffloadStatus::Completed {
                continue;
            }
            let Some(pid) = entry.pid else { continue };
            if pid_alive(pid) {
                continue;
            }
            let note = format!("{STALE_NOTE_PREFIX}:pid_dead:{pid}");
            entry.status = OffloadStatus::Completed;
            entry.end_time = Some(Utc::now());
            entry.ok = Some(false);
            entry.output_snippet = Some(note.clone());
            marked.push(StaleMarked {
                offload_id: entry.offload_id.clone(),
                pid,
                note,
            });
        }
        marked
    })?;

    for stale in &marked {
        tracing::warn!(offload_id = %stale.offload_id, pid = stale.pid, "Offload marked stale");
        emit_telemetry_event(
            "offload_monitor.stale_detected",
            json!({
                "offload_id": stale.offload_id,
                "pid": stale.pid,
                "note": stale.note,
            }),
        );
    }
    Ok(marked)
}

/// Drop entries past the retention window, then enforce the entry cap by
/// evicting the oldest completed entries before anything still running.
pub fn rotate_registry(
    registry: &OffloadRegistry,
    retention_days: i64,
    max_entries: usize,
    now: DateTime<Utc>,
) -> Result<RotationSummary, RegistryError> {
    registry.mutate(|entries| {
        let before_count = entries.len();
        let cutoff = now - ChronoDuration::days(retention_days);
        entries.retain(|_, entry| entry.age_reference() >= cutoff);

        if entries.len() > max_entries {
            let mut by_age: Vec<(DateTime<Utc>, bool, String)> = entries
                .values()
                .map(|e| (e.start_time, e.is_completed(), e.offload_id.clone()))
                .collect();
            by_age.sort();

            let mut excess = entries.len() - max_entries;
            for (_, completed, id) in &by_age {
                if excess == 0 {
                    break;
                }
                if *completed {
                    entries.remove(id);
                    excess -= 1;
                }
            }
            for (_, _, id) in &by_age {
                if excess == 0 {
                    break;
                }
                if entries.remove(id).is_some() {
                    excess -= 1;
                }
            }
        }

        RotationSummary {
            removed_count: before_count - entries.len(),
            before_count,
            after_count: entries.len(),
        }
    })
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorPass {
    pub stale_marked: usize,
    pub stats: OffloadStats,
    pub rotate: RotationSummary,
}

/// Sweep, summarize, rotate.
pub fn monitor_once(
    registry: &OffloadRegistry,
    settings: &MonitorSettings,
) -> Result<MonitorPass, RegistryError> {
    let stale = check_and_mark_stale(registry)?;
    let stats = compute_stats(&registry.entries());
    emit_telemetry_event("offload_monitor.summary", json!({ "stats": stats }));
    metrics::gauge!("offload_registry_active").set(stats.active as f64);
    metrics::gauge!("offload_registry_total").set(stats.total as f64);

    let rotate = rotate_registry(
        registry,
        settings.retention_days,
        settings.max_entries,
        Utc::now(),
    )?;
    if rotate.removed_count > 0 {
        emit_telemetry_event("offload_monitor.rotate", json!({ "result": rotate }));
    }
    if stats.stale >= settings.alert_stale_threshold {
        emit_telemetry_event(
            "offload_monitor.alert",
            json!({ "reason": "stale_threshold_exceeded", "stale": stats.stale }),
        );
    }
    Ok(MonitorPass {
        stale_marked: stale.len(),
        stats,
        rotate,
    })
}

/// Run [`monitor_once`] every `interval` until cancelled.
pub async fn monitor_loop(
    registry: std::sync::Arc<OffloadRegistry>,
    settings: MonitorSettings,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let pass = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || monitor_once(&registry, &settings)).await
        };
        match pass {
            Ok(Ok(pass)) => tracing::info!(
                stale_marked = pass.stale_marked,
                active = pass.stats.active,
                removed = pass.rotate.removed_count,
                "Offload monitor pass complete"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "Offload monitor pass failed"),
            Err(e) => tracing::error!(error = %e, "Offload monitor task panicked"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Offload monitor loop cancelled");
                return;
            }
        }
    }
}
