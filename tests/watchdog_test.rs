//! Watchdog supervision against scripted bot processes, under paused time.

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use kvk_ingest::config::RuntimePaths;
use kvk_ingest::models::exit::ExitClassification;
use kvk_ingest::services::exit_protocol::FileExitProtocol;
use kvk_ingest::services::watchdog::{
    StopReason, SupervisionReport, Watchdog, WatchdogEvent, WatchdogPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn policy() -> WatchdogPolicy {
    WatchdogPolicy {
        crash_threshold: 3,
        restart_flag_grace: secs(1),
        ..WatchdogPolicy::default()
    }
}

async fn supervise(
    paths: &RuntimePaths,
    scripts: Vec<ChildScript>,
    policy: WatchdogPolicy,
    shutdown: CancellationToken,
) -> SupervisionReport {
    std::fs::create_dir_all(&paths.data_dir).unwrap();
    let watchdog = Watchdog::new(
        ScriptedLauncher::new(paths, scripts),
        Arc::new(FileExitProtocol::new(paths)),
        paths.clone(),
        policy,
        shutdown,
    );
    watchdog.run().await
}

fn backoff_bases(report: &SupervisionReport) -> Vec<Duration> {
    report
        .events
        .iter()
        .filter_map(|e| match e {
            WatchdogEvent::Backoff { base, .. } => Some(*base),
            _ => None,
        })
        .collect()
}

fn classifications(report: &SupervisionReport) -> Vec<String> {
    report
        .events
        .iter()
        .filter_map(|e| match e {
            WatchdogEvent::Exited { classification, .. } => Some(classification.to_string()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_crash_backoff_doubles_and_healthy_run_resets() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, secs(400)),
        ],
        WatchdogPolicy {
            crash_window: secs(5),
            ..policy()
        },
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.stop, StopReason::ShutdownMarker);
    assert_eq!(report.launches(), 4);
    assert_eq!(backoff_bases(&report), vec![secs(2), secs(4), secs(1)]);
    for event in &report.events {
        if let WatchdogEvent::Backoff { base, slept } = event {
            assert!(*slept >= *base && *slept <= *base + *base / 2);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_planned_restart_resets_backoff_and_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::PlannedRestart,
            ChildScript::Crash(1, Duration::ZERO),
        ],
        WatchdogPolicy {
            crash_window: secs(1),
            ..policy()
        },
        CancellationToken::new(),
    )
    .await;

    assert_eq!(
        classifications(&report),
        vec!["crash", "crash", "planned_restart", "crash", "shutdown"]
    );
    assert_eq!(backoff_bases(&report), vec![secs(2), secs(4), secs(1), secs(2)]);

    let log = std::fs::read_to_string(&paths.restart_log_file).unwrap();
    assert!(log.lines().any(|l| l.ends_with(",manual,SYSTEM,success")));
    assert_eq!(log.lines().filter(|l| l.ends_with(",crash,SYSTEM,crash_recovery")).count(), 3);
    let info = std::fs::read_to_string(&paths.last_restart_info_file).unwrap();
    assert!(info.contains("deploy"));
    assert!(!paths.restart_flag_file.exists());
    assert!(!paths.exit_code_file.exists());
}

#[tokio::test(start_paused = true)]
async fn test_crash_storm_triggers_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
        ],
        policy(),
        CancellationToken::new(),
    )
    .await;

    let cooldowns: Vec<&WatchdogEvent> = report
        .events
        .iter()
        .filter(|e| matches!(e, WatchdogEvent::Cooldown { .. }))
        .collect();
    assert_eq!(cooldowns, vec![&WatchdogEvent::Cooldown { duration: secs(60) }]);
    // History is cleared after the cooldown, so the fourth crash backs off from the minimum
    assert_eq!(backoff_bases(&report), vec![secs(2), secs(4), secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_restart_code_without_flag_counts_as_crash() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![ChildScript::RestartWithoutFlag],
        policy(),
        CancellationToken::new(),
    )
    .await;

    let first = report
        .events
        .iter()
        .find_map(|e| match e {
            WatchdogEvent::Exited { classification, .. } => Some(classification.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        first,
        ExitClassification::Crash {
            code: Some(15),
            missing_flag: true
        }
    );
    let log = std::fs::read_to_string(&paths.restart_log_file).unwrap();
    assert!(log.contains(",crash,SYSTEM,exit_15_no_flag"));
}

#[tokio::test(start_paused = true)]
async fn test_parent_signal_stops_child_and_supervision() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(30)).await;
            shutdown.cancel();
        });
    }

    let report = supervise(&paths, vec![ChildScript::RunForever], policy(), shutdown).await;

    assert_eq!(report.launches(), 1);
    assert_eq!(report.stop, StopReason::ShutdownMarker);
    assert_eq!(classifications(&report), vec!["shutdown"]);
    assert!(!paths.bot_pid_file.exists());
    assert!(!paths.shutdown_marker_file.exists());
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_without_marker_is_graceful() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![
            ChildScript::Crash(0, Duration::ZERO),
            ChildScript::Crash(1, Duration::ZERO),
        ],
        policy(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.stop, StopReason::Graceful);
    assert_eq!(report.launches(), 1);
    assert_eq!(classifications(&report), vec!["graceful"]);
    assert!(backoff_bases(&report).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exit_code_file_overrides_process_status() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![ChildScript::RestartWithStatusOne],
        policy(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(classifications(&report), vec!["planned_restart", "shutdown"]);
    assert_eq!(report.launches(), 2);
    let info = std::fs::read_to_string(&paths.last_restart_info_file).unwrap();
    assert!(info.contains("config reload"));
}

#[tokio::test(start_paused = true)]
async fn test_pid_file_of_another_process_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let paths = runtime_paths(dir.path());
    let report = supervise(
        &paths,
        vec![ChildScript::HandOverPid(99_999)],
        policy(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.stop, StopReason::ShutdownMarker);
    assert_eq!(
        std::fs::read_to_string(&paths.bot_pid_file).unwrap().trim(),
        "99999"
    );
}
