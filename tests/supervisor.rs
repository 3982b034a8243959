// Supervisor and registry behavior under simulated time

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use camkeeper_lib::backend::BackendRecording;
use camkeeper_lib::recording::{
    ErrorKind, LaunchError, RecordingSession, RegistryEvent, SessionState, StartRequest,
    SupervisorConfig, SupervisorError, SyncOutcome, TimeSource,
};
use camkeeper_lib::session::SessionStore;

use common::{advance, camera, fast_config, harness, harness_with, Behavior, TokioTime};

fn state_of(h: &common::Harness, camera_id: &str) -> SessionState {
    h.registry.status_of(camera_id).unwrap().state
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test(start_paused = true)]
async fn start_records_and_persists() {
    let h = harness(fast_config());
    let mut events = h.registry.subscribe();

    let status = h.registry.start(camera("cam")).await.unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.started_at, Some(h.time.now()));
    assert_eq!(status.last_activity_at, status.started_at);
    assert_eq!(status.reconnect_attempts, 0);

    let persisted = h.store.get("cam").unwrap().unwrap();
    assert_eq!(persisted.state, SessionState::Recording);

    let path = status.output_path.unwrap();
    assert!(path.starts_with(h.dir.path().join("Camera_cam")));

    assert_eq!(
        events.try_recv().unwrap(),
        RegistryEvent::StateChanged {
            camera_id: "cam".into(),
            state: SessionState::Starting
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        RegistryEvent::StateChanged {
            camera_id: "cam".into(),
            state: SessionState::Recording
        }
    );
}

#[tokio::test(start_paused = true)]
async fn start_while_active_is_refused() {
    let h = harness(fast_config());
    h.registry.start(camera("cam")).await.unwrap();

    let err = h.registry.start(camera("cam")).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Launch {
            source: LaunchError::AlreadyActive {
                state: SessionState::Recording,
                ..
            },
            ..
        }
    ));
    assert_eq!(h.launcher.launches_for("cam"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_launch_is_surfaced_and_restartable() {
    let h = harness(fast_config());
    h.launcher.script("cam", &[Behavior::FailLaunch, Behavior::Live]);

    let err = h.registry.start(camera("cam")).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Launch {
            source: LaunchError::Spawn(_),
            ..
        }
    ));

    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Failed);
    assert_eq!(status.recent_errors.last().unwrap().kind, ErrorKind::Launch);

    let status = h.registry.start(camera("cam")).await.unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert!(status.recent_errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_all_settles_every_camera() {
    let h = harness(fast_config());
    h.launcher.script("b", &[Behavior::FailLaunch]);

    let outcomes = h
        .registry
        .start_all(vec![camera("a"), camera("b"), camera("c")])
        .await;

    let summary: Vec<_> = outcomes.iter().map(|o| (o.camera_id.as_str(), o.ok)).collect();
    assert_eq!(summary, vec![("a", true), ("b", false), ("c", true)]);
    assert!(outcomes[1].error.as_deref().unwrap().contains("camera unreachable"));

    assert_eq!(state_of(&h, "a"), SessionState::Recording);
    assert_eq!(state_of(&h, "b"), SessionState::Failed);

    let stopped = h.registry.stop_all().await;
    assert!(stopped.iter().all(|o| o.ok));
    assert!(h.registry.status().is_empty());
}

#[tokio::test(start_paused = true)]
async fn same_name_cameras_record_to_separate_files() {
    let h = harness(fast_config());
    let lobby = |id: &str| StartRequest {
        camera_name: "Lobby".into(),
        ..camera(id)
    };

    let outcomes = h.registry.start_all(vec![lobby("cam-a"), lobby("cam-b")]).await;
    assert!(outcomes.iter().all(|o| o.ok));

    let a = h.launcher.launched_paths("cam-a").remove(0);
    let b = h.launcher.launched_paths("cam-b").remove(0);
    assert_ne!(a, b);
    assert_eq!(a.parent(), b.parent());
    assert!(a.exists());
    assert!(b.exists());
}

// ============================================================================
// Health and reconnect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stale_camera_reconnects_without_losing_start_time() {
    let h = harness(SupervisorConfig::default());
    h.launcher.script("C1", &[Behavior::Silent, Behavior::Live]);

    let started_at = h.registry.start(camera("C1")).await.unwrap().started_at;

    // Probes at 30s and 60s see silence, but not yet past the 60s threshold
    advance(89_000).await;
    let status = h.registry.status_of("C1").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert!(status.recent_errors.is_empty());

    // Third probe at 90s
    advance(2_000).await;
    let status = h.registry.status_of("C1").unwrap();
    assert_eq!(status.state, SessionState::Reconnecting);
    assert_eq!(status.recent_errors[0].kind, ErrorKind::StaleConnection);

    // Relaunched after the 5s delay, but no frame seen yet
    advance(4_100).await;
    let status = h.registry.status_of("C1").unwrap();
    assert_eq!(status.state, SessionState::Reconnecting);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(h.launcher.launches_for("C1"), 2);

    // First frame from the new process
    advance(1_000).await;
    let status = h.registry.status_of("C1").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.started_at, started_at);

    let paths = h.launcher.launched_paths("C1");
    assert_ne!(paths[0], paths[1]);

    h.registry.stop("C1").await.unwrap();
    let history = h.registry.history(Some("C1"), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].segments.len(), 2);
    assert_eq!(Some(history[0].started_at), started_at);
}

#[tokio::test(start_paused = true)]
async fn relaunch_stays_reconnecting_until_first_frame() {
    let h = harness(fast_config());
    h.launcher.script("cam", &[Behavior::Silent]);
    h.registry.start(camera("cam")).await.unwrap();

    // Stale at 2s, relaunched at 2.1s into another silent capture
    advance(2_150).await;
    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(h.launcher.launches_for("cam"), 2);
    assert_eq!(status.state, SessionState::Reconnecting);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(
        h.store.get("cam").unwrap().unwrap().state,
        SessionState::Reconnecting
    );

    // Still nothing a few polls later
    advance(1_000).await;
    assert_eq!(state_of(&h, "cam"), SessionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let config = SupervisorConfig {
        max_reconnect_attempts: 3,
        ..fast_config()
    };
    let h = harness(config);
    h.launcher.script("cam", &[Behavior::Silent, Behavior::FailLaunch]);
    let mut events = h.registry.subscribe();

    h.registry.start(camera("cam")).await.unwrap();
    advance(10_000).await;

    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Failed);
    assert_eq!(status.reconnect_attempts, 3);
    assert_eq!(status.recent_errors.last().unwrap().kind, ErrorKind::ReconnectExhausted);
    assert_eq!(
        status
            .recent_errors
            .iter()
            .filter(|e| e.kind == ErrorKind::ReconnectFailed)
            .count(),
        3
    );
    assert_eq!(h.launcher.launches_for("cam"), 4);

    // Nothing relaunches a failed session on its own
    advance(60_000).await;
    assert_eq!(h.launcher.launches_for("cam"), 4);

    let mut exhausted = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (RegistryEvent::ReconnectExhausted {
                camera_id: "cam".into(),
                attempts: 3,
            })
        {
            exhausted = true;
        }
    }
    assert!(exhausted);

    // Failed sessions stay until stopped
    assert!(h.store.get("cam").unwrap().is_some());
    h.registry.stop("cam").await.unwrap();
    assert!(h.registry.status_of("cam").is_none());
}

#[tokio::test(start_paused = true)]
async fn relaunch_that_never_produces_frames_counts_as_failed() {
    let config = SupervisorConfig {
        max_reconnect_attempts: 2,
        ..fast_config()
    };
    let h = harness(config);
    h.launcher.script("cam", &[Behavior::Silent]);

    h.registry.start(camera("cam")).await.unwrap();
    advance(20_000).await;

    assert_eq!(state_of(&h, "cam"), SessionState::Failed);
    assert_eq!(h.launcher.launches_for("cam"), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_max_attempts_retries_forever_until_stopped() {
    let config = SupervisorConfig {
        max_reconnect_attempts: 0,
        ..fast_config()
    };
    let h = harness(config);
    h.launcher.script("cam", &[Behavior::Silent, Behavior::FailLaunch]);

    h.registry.start(camera("cam")).await.unwrap();
    advance(10_000).await;

    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Reconnecting);
    assert!(status.reconnect_attempts > 20);
    assert_eq!(status.recent_errors.len(), 10);

    // Stop cuts the reconnect wait short
    h.registry.stop("cam").await.unwrap();
    assert!(h.registry.status_of("cam").is_none());
    let launches = h.launcher.launches_for("cam");
    advance(5_000).await;
    assert_eq!(h.launcher.launches_for("cam"), launches);
}

#[tokio::test(start_paused = true)]
async fn stale_without_auto_reconnect_fails_immediately() {
    let config = SupervisorConfig {
        auto_reconnect: false,
        ..fast_config()
    };
    let h = harness(config);
    h.launcher.script("cam", &[Behavior::Silent]);

    h.registry.start(camera("cam")).await.unwrap();
    advance(5_000).await;

    assert_eq!(state_of(&h, "cam"), SessionState::Failed);
    assert_eq!(h.launcher.launches_for("cam"), 1);
}

#[tokio::test(start_paused = true)]
async fn config_update_reaches_running_supervisor() {
    let h = harness(SupervisorConfig::default());
    h.launcher.script("cam", &[Behavior::Silent, Behavior::Live]);
    h.registry.start(camera("cam")).await.unwrap();

    h.registry.update_config(fast_config());
    // The 30s tick already scheduled still fires first and finds the camera stale
    advance(31_000).await;
    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(h.launcher.launches_for("cam"), 2);
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let h = harness(fast_config());

    h.registry.stop("never-started").await.unwrap();

    h.registry.start(camera("cam")).await.unwrap();
    advance(3_000).await;
    h.registry.stop("cam").await.unwrap();

    assert!(h.registry.status().is_empty());
    assert!(h.store.load_all().unwrap().is_empty());
    assert_eq!(h.registry.history(None, 10).unwrap().len(), 1);

    h.registry.stop("cam").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_stop_keeps_the_session() {
    let h = harness(fast_config());
    h.registry.start(camera("cam")).await.unwrap();
    h.launcher.stop_fails.store(true, Ordering::SeqCst);

    let err = h.registry.stop("cam").await.unwrap_err();
    assert!(matches!(err, SupervisorError::StopFailed { .. }));

    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.recent_errors.last().unwrap().kind, ErrorKind::StopFailed);
    assert_eq!(h.store.get("cam").unwrap().unwrap().state, SessionState::Recording);

    h.launcher.stop_fails.store(false, Ordering::SeqCst);
    h.registry.stop("cam").await.unwrap();
    assert!(h.registry.status_of("cam").is_none());
}

// ============================================================================
// Pause
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pause_freezes_elapsed_but_capture_keeps_running() {
    let h = harness(fast_config());
    h.registry.start(camera("cam")).await.unwrap();

    advance(10_000).await;
    h.registry.pause("cam").await.unwrap();
    assert_eq!(state_of(&h, "cam"), SessionState::Paused);

    advance(20_000).await;
    // Pausing twice changes nothing
    h.registry.pause("cam").await.unwrap();

    let elapsed = h.registry.elapsed();
    assert_eq!(elapsed.sessions[0].elapsed_seconds, 10);
    assert_eq!(elapsed.sessions[0].paused_seconds, 20);
    assert_eq!(h.launcher.launches_for("cam"), 1);

    h.registry.resume("cam").await.unwrap();
    advance(5_000).await;
    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.elapsed_seconds, 15);
    assert_eq!(status.paused_seconds, 20);
}

#[tokio::test(start_paused = true)]
async fn pause_requires_a_recording_session() {
    let h = harness(fast_config());
    assert!(matches!(
        h.registry.pause("ghost").await,
        Err(SupervisorError::NotFound(_))
    ));

    h.launcher.script("cam", &[Behavior::Silent, Behavior::FailLaunch]);
    h.registry.start(camera("cam")).await.unwrap();
    advance(2_050).await;
    assert_eq!(state_of(&h, "cam"), SessionState::Reconnecting);

    assert!(matches!(
        h.registry.pause("cam").await,
        Err(SupervisorError::InvalidTransition {
            state: SessionState::Reconnecting,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn paused_session_stays_paused_across_reconnect() {
    let h = harness(fast_config());
    h.launcher.script("cam", &[Behavior::Silent, Behavior::Live]);
    h.registry.start(camera("cam")).await.unwrap();

    advance(500).await;
    h.registry.pause("cam").await.unwrap();

    advance(2_500).await;
    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(h.launcher.launches_for("cam"), 2);
    assert_eq!(status.state, SessionState::Paused);
    assert_eq!(status.elapsed_seconds, 0);
}

#[tokio::test(start_paused = true)]
async fn pause_all_and_resume_all() {
    let h = harness(fast_config());
    h.registry.start_all(vec![camera("a"), camera("b")]).await;

    let paused = h.registry.pause_all().await;
    assert_eq!(paused.len(), 2);
    assert!(paused.iter().all(|o| o.ok));
    assert_eq!(state_of(&h, "a"), SessionState::Paused);
    assert_eq!(state_of(&h, "b"), SessionState::Paused);

    let resumed = h.registry.resume_all().await;
    assert_eq!(resumed.len(), 2);
    assert_eq!(state_of(&h, "a"), SessionState::Recording);
}

// ============================================================================
// Backend reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn negative_backend_answer_never_removes_a_session() {
    let h = harness(fast_config());
    h.registry.start(camera("cam")).await.unwrap();

    h.backend.set(
        "cam",
        BackendRecording {
            is_recording: false,
            ..Default::default()
        },
    );
    assert_eq!(h.registry.sync_from_backend("cam").await, SyncOutcome::NotRecording);
    assert_eq!(state_of(&h, "cam"), SessionState::Recording);

    h.backend.unavailable.store(true, Ordering::SeqCst);
    assert_eq!(
        h.registry.sync_from_backend("cam").await,
        SyncOutcome::BackendUnavailable
    );
    assert_eq!(state_of(&h, "cam"), SessionState::Recording);
    assert!(h.store.get("cam").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn backend_recording_is_adopted_with_its_start_time() {
    let h = harness(fast_config());
    let remote_start = h.time.now() - ChronoDuration::hours(1);
    h.backend.set(
        "gate",
        BackendRecording {
            is_recording: true,
            started_at: Some(remote_start),
            camera_name: Some("Gate".into()),
            source_url: Some("http://gate.local/stream".into()),
            scenario_id: None,
            scenario_name: Some("Night".into()),
        },
    );

    assert_eq!(h.registry.sync_from_backend("gate").await, SyncOutcome::Adopted);
    assert_eq!(state_of(&h, "gate"), SessionState::Reconnecting);
    advance(300).await;

    let status = h.registry.status_of("gate").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.started_at, Some(remote_start));
    assert_eq!(status.scenario_name.as_deref(), Some("Night"));
    assert_eq!(status.reconnect_attempts, 0);
    assert!(status.elapsed_seconds >= 3_600);
    assert_eq!(h.launcher.launches_for("gate"), 1);

    assert_eq!(h.registry.sync_from_backend("gate").await, SyncOutcome::AlreadyTracked);
    assert_eq!(h.launcher.launches_for("gate"), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_recording_does_not_revive_a_failed_session() {
    let h = harness(fast_config());
    h.launcher.script("gate", &[Behavior::FailLaunch, Behavior::Live]);
    h.registry.start(camera("gate")).await.unwrap_err();
    assert_eq!(state_of(&h, "gate"), SessionState::Failed);

    h.backend.set(
        "gate",
        BackendRecording {
            is_recording: true,
            source_url: Some("http://gate.local/stream".into()),
            ..Default::default()
        },
    );
    assert_eq!(h.registry.sync_from_backend("gate").await, SyncOutcome::LocallyFailed);
    advance(2_000).await;

    assert_eq!(state_of(&h, "gate"), SessionState::Failed);
    assert_eq!(h.launcher.launches_for("gate"), 1);

    // An operator restart still works
    let status = h.registry.start(camera("gate")).await.unwrap();
    assert_eq!(status.state, SessionState::Recording);
}

#[tokio::test(start_paused = true)]
async fn backend_record_without_source_is_not_adopted() {
    let h = harness(fast_config());
    h.backend.set(
        "cam",
        BackendRecording {
            is_recording: true,
            ..Default::default()
        },
    );

    assert_eq!(h.registry.sync_from_backend("cam").await, SyncOutcome::Unresolvable);
    assert!(h.registry.status_of("cam").is_none());
}

#[tokio::test(start_paused = true)]
async fn backend_start_time_corrects_local_drift() {
    let h = harness(fast_config());
    h.registry.start(camera("cam")).await.unwrap();
    let remote_start = h.time.now() - ChronoDuration::minutes(5);
    h.backend.set(
        "cam",
        BackendRecording {
            is_recording: true,
            started_at: Some(remote_start),
            ..Default::default()
        },
    );

    assert_eq!(h.registry.sync_from_backend("cam").await, SyncOutcome::AlreadyTracked);
    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.started_at, Some(remote_start));
    assert_eq!(status.elapsed_seconds, 300);
}

// ============================================================================
// Foreground and elapsed time
// ============================================================================

#[tokio::test(start_paused = true)]
async fn foreground_resyncs_to_backend_start() {
    let h = harness(SupervisorConfig::default());
    h.registry.start(camera("cam")).await.unwrap();
    let remote_start = h.time.now() - ChronoDuration::hours(2);
    *h.backend.earliest.lock() = Some(remote_start);

    let snapshot = h.registry.on_foreground().await;
    assert_eq!(snapshot.recording_start, Some(remote_start));
    assert_eq!(snapshot.elapsed_seconds, 7_200);
    assert_eq!(snapshot.formatted, "2:00:00");
    assert_eq!(snapshot.active_sessions, 1);
}

#[tokio::test(start_paused = true)]
async fn foreground_falls_back_to_earliest_local_start() {
    let h = harness(SupervisorConfig::default());
    h.backend.unavailable.store(true, Ordering::SeqCst);

    let first = h.registry.start(camera("a")).await.unwrap().started_at;
    advance(60_000).await;
    h.registry.start(camera("b")).await.unwrap();

    let snapshot = h.registry.on_foreground().await;
    assert_eq!(snapshot.recording_start, first);
    assert_eq!(snapshot.elapsed_seconds, 60);
}

#[tokio::test(start_paused = true)]
async fn elapsed_is_correct_after_long_unobserved_gap() {
    let h = harness(SupervisorConfig::default());
    h.registry.start(camera("cam")).await.unwrap();

    advance(3_600_000).await;
    let snapshot = h.registry.elapsed();
    assert_eq!(snapshot.elapsed_seconds, 3_600);
    assert_eq!(snapshot.sessions[0].elapsed_seconds, 3_600);
}

// ============================================================================
// Restart
// ============================================================================

fn persisted(request: StartRequest, state: SessionState, started_at: chrono::DateTime<chrono::Utc>) -> RecordingSession {
    let mut session = RecordingSession::new(&request);
    session.state = state;
    session.started_at = Some(started_at);
    session.last_activity_at = Some(started_at);
    let mut clock = session.session_clock();
    clock.start_at(started_at);
    session.clock = clock.state().clone();
    session
}

#[tokio::test(start_paused = true)]
async fn rehydrate_resumes_persisted_sessions() {
    let time = Arc::new(TokioTime::new());
    let earlier = time.now() - ChronoDuration::minutes(10);

    let store = SessionStore::open_in_memory().unwrap();
    store
        .upsert(&persisted(camera("rec"), SessionState::Recording, earlier))
        .unwrap();
    store
        .upsert(&persisted(camera("stopping"), SessionState::Stopping, earlier))
        .unwrap();
    store
        .upsert(&persisted(camera("idle"), SessionState::Idle, earlier))
        .unwrap();
    let mut paused = persisted(camera("paused"), SessionState::Paused, earlier);
    let mut clock = paused.session_clock();
    clock.pause_at(earlier + ChronoDuration::minutes(1));
    paused.clock = clock.state().clone();
    store.upsert(&paused).unwrap();

    let h = harness_with(fast_config(), time, store);
    assert_eq!(h.registry.rehydrate().unwrap(), 2);
    advance(300).await;

    let rec = h.registry.status_of("rec").unwrap();
    assert_eq!(rec.state, SessionState::Recording);
    assert_eq!(rec.started_at, Some(earlier));
    assert_eq!(rec.reconnect_attempts, 0);

    let paused = h.registry.status_of("paused").unwrap();
    assert_eq!(paused.state, SessionState::Paused);
    assert_eq!(paused.elapsed_seconds, 60);

    let stopping = h.registry.status_of("stopping").unwrap();
    assert_eq!(stopping.state, SessionState::Failed);
    assert_eq!(stopping.recent_errors.last().unwrap().kind, ErrorKind::Interrupted);
    assert_eq!(h.launcher.launches_for("stopping"), 0);

    assert!(h.registry.status_of("idle").is_none());
    assert!(h.store.get("idle").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_sessions_for_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let time: Arc<TokioTime> = Arc::new(TokioTime::new());

    let started_at = {
        let h = harness_with(fast_config(), time.clone(), SessionStore::open(&db).unwrap());
        let started_at = h.registry.start(camera("cam")).await.unwrap().started_at;
        h.registry.shutdown().await;
        started_at
    };

    advance(30_000).await;

    let h = harness_with(fast_config(), time, SessionStore::open(&db).unwrap());
    assert_eq!(h.registry.rehydrate().unwrap(), 1);
    advance(300).await;

    let status = h.registry.status_of("cam").unwrap();
    assert_eq!(status.state, SessionState::Recording);
    assert_eq!(status.started_at, started_at);
    assert_eq!(status.elapsed_seconds, 30);
}
