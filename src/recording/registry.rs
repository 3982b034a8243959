// Registry of per-camera supervisors
//
// Owns the shared camera -> session map and the supervisor handles, fans
// bulk commands out concurrently, and reconciles local state with the
// backend. Local sessions are only ever removed by a confirmed stop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use super::capture::CaptureLauncher;
use super::clock::{format_duration, SessionClock, TimeSource};
use super::supervisor::{self, Command, SupervisorConfig, SupervisorContext, SupervisorHandle};
use super::{
    ErrorEntry, ErrorKind, LaunchError, RecordingSession, SessionState, SessionStatus,
    StartRequest, SupervisorError,
};
use crate::backend::{BackendError, RecordingBackend};
use crate::session::{RecordingSummary, SessionStore};

/// Notifications about session changes
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RegistryEvent {
    StateChanged {
        camera_id: String,
        state: SessionState,
    },
    LaunchFailed {
        camera_id: String,
        reason: String,
    },
    ReconnectExhausted {
        camera_id: String,
        attempts: u32,
    },
    StopFailed {
        camera_id: String,
        reason: String,
    },
}

/// Per-camera result of a bulk command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraOutcome {
    pub camera_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CameraOutcome {
    fn from_result(camera_id: String, result: Result<(), SupervisorError>) -> Self {
        match result {
            Ok(()) => Self {
                camera_id,
                ok: true,
                error: None,
            },
            Err(e) => Self {
                camera_id,
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of reconciling one camera with the backend
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Backend and registry agree the camera is recording
    AlreadyTracked,
    /// Backend reported a recording we did not know about; now supervised
    Adopted,
    /// Backend says not recording. Local state, if any, is left alone.
    NotRecording,
    BackendUnavailable,
    /// Backend says recording but gave no source address to capture from
    Unresolvable,
    /// Local session gave up; only an operator restart relaunches it
    LocallyFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraElapsed {
    pub camera_id: String,
    pub state: SessionState,
    pub elapsed_seconds: u64,
    pub paused_seconds: u64,
}

/// Display timer plus per-camera durations, computed at one instant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElapsedSnapshot {
    pub recording_start: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub paused_seconds: u64,
    pub formatted: String,
    pub active_sessions: usize,
    pub sessions: Vec<CameraElapsed>,
}

/// Collaborators for a registry
pub struct RegistryOptions {
    pub launcher: Arc<dyn CaptureLauncher>,
    pub backend: Arc<dyn RecordingBackend>,
    pub store: Arc<SessionStore>,
    pub time: Arc<dyn TimeSource>,
    pub config: SupervisorConfig,
    pub storage_path: PathBuf,
}

pub struct SupervisorRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<RecordingSession>>>>,
    supervisors: Mutex<HashMap<String, SupervisorHandle>>,
    config: Arc<RwLock<SupervisorConfig>>,
    launcher: Arc<dyn CaptureLauncher>,
    backend: Arc<dyn RecordingBackend>,
    store: Arc<SessionStore>,
    time: Arc<dyn TimeSource>,
    storage_path: PathBuf,
    display_clock: Mutex<SessionClock>,
    events: broadcast::Sender<RegistryEvent>,
    shutdown: CancellationToken,
}

impl SupervisorRegistry {
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            config: Arc::new(RwLock::new(options.config)),
            launcher: options.launcher,
            backend: options.backend,
            store: options.store,
            time: options.time,
            storage_path: options.storage_path,
            display_clock: Mutex::new(SessionClock::new()),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> SupervisorConfig {
        self.config.read().clone()
    }

    /// Running supervisors read the new values at their next decision point
    pub fn update_config(&self, config: SupervisorConfig) {
        log::info!("[Registry] Supervisor config updated: {:?}", config);
        *self.config.write() = config;
    }

    fn context(&self, entry: Arc<Mutex<RecordingSession>>) -> SupervisorContext {
        SupervisorContext {
            entry,
            config: self.config.clone(),
            launcher: self.launcher.clone(),
            store: self.store.clone(),
            time: self.time.clone(),
            events: self.events.clone(),
            storage_path: self.storage_path.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    fn entry(&self, camera_id: &str) -> Option<Arc<Mutex<RecordingSession>>> {
        self.sessions.read().get(camera_id).cloned()
    }

    /// Start recording one camera
    pub async fn start(&self, request: StartRequest) -> Result<SessionStatus, SupervisorError> {
        let camera_id = request.camera_id.clone();

        // Claim the camera under the map lock so two starts cannot both win
        let entry = {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&camera_id) {
                let state = existing.lock().state;
                if !state.can_start() {
                    return Err(SupervisorError::Launch {
                        camera_id: camera_id.clone(),
                        source: LaunchError::AlreadyActive { camera_id, state },
                    });
                }
            }
            let mut session = RecordingSession::new(&request);
            session.state = SessionState::Starting;
            let entry = Arc::new(Mutex::new(session));
            sessions.insert(camera_id.clone(), entry.clone());
            entry
        };
        // A finished task from a previous failed run
        self.supervisors.lock().remove(&camera_id);

        let _ = self.events.send(RegistryEvent::StateChanged {
            camera_id: camera_id.clone(),
            state: SessionState::Starting,
        });
        log::info!("[Registry] Starting {} ({})", camera_id, request.source_url);

        let handle = supervisor::start(self.context(entry.clone())).await?;
        self.supervisors.lock().insert(camera_id, handle);
        self.refresh_display_clock();

        let status = entry.lock().status_at(self.time.now());
        Ok(status)
    }

    /// Stop one camera. Stopping an unknown or idle camera succeeds.
    pub async fn stop(&self, camera_id: &str) -> Result<(), SupervisorError> {
        let Some(entry) = self.entry(camera_id) else {
            return Ok(());
        };

        let state = entry.lock().state;
        match state {
            SessionState::Idle | SessionState::Failed => {
                self.forget(camera_id, &entry);
                return Ok(());
            }
            SessionState::Starting => {
                return Err(SupervisorError::InvalidTransition {
                    camera_id: camera_id.to_string(),
                    state,
                    action: "stop",
                });
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        if !self.send(camera_id, Command::Stop(tx)).await {
            // Task is gone and its process was killed with it
            log::warn!("[Registry] {} has no supervisor, clearing", camera_id);
            self.forget(camera_id, &entry);
            return Ok(());
        }

        match rx.await {
            Ok(Ok(())) => {
                self.forget(camera_id, &entry);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::warn!("[Registry] {} supervisor exited during stop, clearing", camera_id);
                self.forget(camera_id, &entry);
                Ok(())
            }
        }
    }

    pub async fn pause(&self, camera_id: &str) -> Result<(), SupervisorError> {
        self.request(camera_id, "pause", Command::Pause).await
    }

    pub async fn resume(&self, camera_id: &str) -> Result<(), SupervisorError> {
        self.request(camera_id, "resume", Command::Resume).await
    }

    async fn request(
        &self,
        camera_id: &str,
        action: &'static str,
        make: fn(oneshot::Sender<Result<(), SupervisorError>>) -> Command,
    ) -> Result<(), SupervisorError> {
        let entry = self
            .entry(camera_id)
            .ok_or_else(|| SupervisorError::NotFound(camera_id.to_string()))?;

        let state = entry.lock().state;
        if !matches!(state, SessionState::Recording | SessionState::Paused) {
            return Err(SupervisorError::InvalidTransition {
                camera_id: camera_id.to_string(),
                state,
                action,
            });
        }

        let (tx, rx) = oneshot::channel();
        if !self.send(camera_id, make(tx)).await {
            return Err(SupervisorError::Unavailable(camera_id.to_string()));
        }
        rx.await
            .map_err(|_| SupervisorError::Unavailable(camera_id.to_string()))?
    }

    async fn send(&self, camera_id: &str, cmd: Command) -> bool {
        let sender = self
            .supervisors
            .lock()
            .get(camera_id)
            .filter(|h| !h.is_finished())
            .map(|h| h.commands.clone());
        match sender {
            Some(sender) => sender.send(cmd).await.is_ok(),
            None => false,
        }
    }

    /// Drop a session from every structure, unless it was replaced meanwhile
    fn forget(&self, camera_id: &str, entry: &Arc<Mutex<RecordingSession>>) {
        {
            let mut sessions = self.sessions.write();
            match sessions.get(camera_id) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    sessions.remove(camera_id);
                }
                _ => return,
            }
        }
        self.supervisors.lock().remove(camera_id);
        if let Err(e) = self.store.remove(camera_id) {
            log::warn!("[Registry] Failed to clear {} from store: {}", camera_id, e);
        }
        log::info!("[Registry] {} released", camera_id);
        self.refresh_display_clock();
    }

    /// Start every camera concurrently and report each result
    pub async fn start_all(&self, requests: Vec<StartRequest>) -> Vec<CameraOutcome> {
        let futures = requests.into_iter().map(|request| async move {
            let camera_id = request.camera_id.clone();
            let result = self.start(request).await.map(|_| ());
            CameraOutcome::from_result(camera_id, result)
        });
        let outcomes = join_all(futures).await;
        self.log_outcomes("start", &outcomes);
        outcomes
    }

    /// Stop every tracked camera concurrently and report each result
    pub async fn stop_all(&self) -> Vec<CameraOutcome> {
        let ids = self.camera_ids();
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let result = self.stop(&id).await;
            CameraOutcome::from_result(id, result)
        }))
        .await;
        self.log_outcomes("stop", &outcomes);
        outcomes
    }

    pub async fn pause_all(&self) -> Vec<CameraOutcome> {
        let ids = self.camera_ids_in(SessionState::Recording);
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let result = self.pause(&id).await;
            CameraOutcome::from_result(id, result)
        }))
        .await;
        let now = self.time.now();
        self.display_clock.lock().pause_at(now);
        outcomes
    }

    pub async fn resume_all(&self) -> Vec<CameraOutcome> {
        let ids = self.camera_ids_in(SessionState::Paused);
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let result = self.resume(&id).await;
            CameraOutcome::from_result(id, result)
        }))
        .await;
        let now = self.time.now();
        self.display_clock.lock().resume_at(now);
        outcomes
    }

    fn log_outcomes(&self, action: &str, outcomes: &[CameraOutcome]) {
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.ok).collect();
        if failed.is_empty() {
            log::info!("[Registry] {} succeeded for {} camera(s)", action, outcomes.len());
        } else {
            for outcome in failed {
                log::error!(
                    "[Registry] {} failed for {}: {}",
                    action,
                    outcome.camera_id,
                    outcome.error.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn camera_ids_in(&self, state: SessionState) -> Vec<String> {
        let mut ids: Vec<_> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.lock().state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every session, ordered by camera id
    pub fn status(&self) -> Vec<SessionStatus> {
        let now = self.time.now();
        let mut statuses: Vec<_> = self
            .sessions
            .read()
            .values()
            .map(|entry| entry.lock().status_at(now))
            .collect();
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    pub fn status_of(&self, camera_id: &str) -> Option<SessionStatus> {
        let now = self.time.now();
        self.entry(camera_id).map(|entry| entry.lock().status_at(now))
    }

    /// Source address of a tracked camera
    pub fn source_url(&self, camera_id: &str) -> Option<String> {
        self.entry(camera_id).map(|entry| entry.lock().source_url.clone())
    }

    /// Finished runs, newest first
    pub fn history(&self, camera_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<RecordingSummary>> {
        self.store.recent_recordings(camera_id, limit)
    }

    fn earliest_local_start(&self) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .values()
            .filter_map(|entry| {
                let session = entry.lock();
                session.state.is_active().then_some(session.started_at).flatten()
            })
            .min()
    }

    /// Keep the display clock anchored to the earliest active start
    fn refresh_display_clock(&self) {
        let earliest = self.earliest_local_start();
        let mut clock = self.display_clock.lock();
        match earliest {
            Some(start) if clock.is_running() => clock.resync(start),
            Some(start) => clock.start_at(start),
            None => clock.stop(),
        }
    }

    /// Current elapsed times, recomputed from timestamps
    pub fn elapsed(&self) -> ElapsedSnapshot {
        let now = self.time.now();
        let clock = self.display_clock.lock().clone();

        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .values()
            .map(|entry| {
                let session = entry.lock();
                let session_clock = session.session_clock();
                CameraElapsed {
                    camera_id: session.camera_id.clone(),
                    state: session.state,
                    elapsed_seconds: session_clock.elapsed_seconds_at(now),
                    paused_seconds: session_clock.paused_seconds_at(now),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));

        let elapsed_seconds = clock.elapsed_seconds_at(now);
        ElapsedSnapshot {
            recording_start: clock.recording_start(),
            elapsed_seconds,
            paused_seconds: clock.paused_seconds_at(now),
            formatted: format_duration(elapsed_seconds),
            active_sessions: sessions.iter().filter(|s| s.state.is_active()).count(),
            sessions,
        }
    }

    /// The process regained attention after being suspended or throttled.
    /// Re-anchor the display clock, probe every camera now, and return
    /// fresh durations.
    pub async fn on_foreground(&self) -> ElapsedSnapshot {
        let remote = match self.backend.earliest_active_start().await {
            Ok(start) => start,
            Err(BackendError::Disabled) => None,
            Err(e) => {
                log::warn!("[Registry] Backend unavailable on foreground: {}", e);
                None
            }
        };

        if let Some(start) = remote.or_else(|| self.earliest_local_start()) {
            let mut clock = self.display_clock.lock();
            if clock.is_running() {
                clock.resync(start);
            } else {
                clock.start_at(start);
            }
        }

        let senders: Vec<_> = self
            .supervisors
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .map(|h| h.commands.clone())
            .collect();
        for sender in senders {
            let _ = sender.try_send(Command::Probe);
        }

        log::info!("[Registry] Foreground resync");
        self.elapsed()
    }

    /// Reconcile one camera with the backend.
    ///
    /// Only adds or corrects; a negative or failed answer never removes a
    /// local session.
    pub async fn sync_from_backend(&self, camera_id: &str) -> SyncOutcome {
        let record = match self.backend.recording_status(camera_id).await {
            Ok(record) => record,
            Err(e) => {
                log::warn!("[Registry] Cannot sync {}: {}", camera_id, e);
                return SyncOutcome::BackendUnavailable;
            }
        };

        let local = self.entry(camera_id);
        let local_state = local.as_ref().map(|entry| entry.lock().state);
        let local_active = local_state.map_or(false, |state| state.is_active());

        if !record.is_recording {
            if local_active {
                log::warn!(
                    "[Registry] Backend reports {} not recording; keeping local session",
                    camera_id
                );
            }
            return SyncOutcome::NotRecording;
        }

        if local_state == Some(SessionState::Failed) {
            log::warn!(
                "[Registry] Backend reports {} recording but it failed here; restart it manually",
                camera_id
            );
            return SyncOutcome::LocallyFailed;
        }

        if local_active {
            if let (Some(entry), Some(remote_start)) = (local, record.started_at) {
                let mut session = entry.lock();
                if session.started_at != Some(remote_start) {
                    log::info!(
                        "[Registry] {} start corrected {:?} -> {}",
                        camera_id,
                        session.started_at,
                        remote_start
                    );
                    session.started_at = Some(remote_start);
                    let mut clock = session.session_clock();
                    clock.resync(remote_start);
                    session.clock = clock.state().clone();
                }
            }
            self.refresh_display_clock();
            return SyncOutcome::AlreadyTracked;
        }

        let Some(request) = record.to_start_request(camera_id) else {
            log::warn!("[Registry] Backend recording for {} has no source", camera_id);
            return SyncOutcome::Unresolvable;
        };

        let started_at = record.started_at.unwrap_or_else(|| self.time.now());
        let mut session = RecordingSession::new(&request);
        session.started_at = Some(started_at);
        session.last_activity_at = Some(self.time.now());
        let mut clock = SessionClock::new();
        clock.start_at(started_at);
        session.clock = clock.state().clone();
        session.state = SessionState::Reconnecting;

        let entry = {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(camera_id) {
                // Changed locally while we were asking
                match existing.lock().state {
                    SessionState::Failed => return SyncOutcome::LocallyFailed,
                    state if state.is_active() => return SyncOutcome::AlreadyTracked,
                    _ => {}
                }
            }
            let entry = Arc::new(Mutex::new(session));
            sessions.insert(camera_id.to_string(), entry.clone());
            entry
        };

        log::info!("[Registry] Adopting {} from backend (started {})", camera_id, started_at);
        let handle = supervisor::spawn_resumed(self.context(entry), SessionState::Recording);
        self.supervisors.lock().insert(camera_id.to_string(), handle);
        self.refresh_display_clock();
        SyncOutcome::Adopted
    }

    /// Pick up sessions persisted by a previous run of the daemon.
    pub fn rehydrate(&self) -> anyhow::Result<usize> {
        let persisted = self.store.load_all()?;
        let now = self.time.now();
        let limit = self.config.read().recent_error_limit;
        let mut resumed = 0;

        for mut session in persisted {
            let camera_id = session.camera_id.clone();
            if self.sessions.read().contains_key(&camera_id) {
                continue;
            }

            match session.state {
                SessionState::Idle => {
                    self.store.remove(&camera_id)?;
                    continue;
                }
                SessionState::Failed => {}
                SessionState::Stopping => {
                    // A stop was in flight; the capture is gone but the
                    // operator never saw it confirmed
                    session.state = SessionState::Failed;
                    session.push_error(
                        ErrorEntry {
                            at: now,
                            kind: ErrorKind::Interrupted,
                            message: "daemon exited while stopping".into(),
                            attempt: None,
                        },
                        limit,
                    );
                    self.store.upsert(&session)?;
                }
                _ if session.started_at.is_none() => {
                    session.state = SessionState::Failed;
                    session.push_error(
                        ErrorEntry {
                            at: now,
                            kind: ErrorKind::Interrupted,
                            message: "daemon exited before capture started".into(),
                            attempt: None,
                        },
                        limit,
                    );
                    self.store.upsert(&session)?;
                }
                _ => {
                    let resume_state = if session.clock.pause_start.is_some() {
                        SessionState::Paused
                    } else {
                        SessionState::Recording
                    };
                    let entry = Arc::new(Mutex::new(session));
                    self.sessions.write().insert(camera_id.clone(), entry.clone());
                    let handle = supervisor::spawn_resumed(self.context(entry), resume_state);
                    self.supervisors.lock().insert(camera_id.clone(), handle);
                    log::info!("[Registry] Resuming {} as {}", camera_id, resume_state);
                    resumed += 1;
                    continue;
                }
            }

            log::info!("[Registry] Restored {} as {}", camera_id, session.state);
            self.sessions
                .write()
                .insert(camera_id, Arc::new(Mutex::new(session)));
        }

        self.refresh_display_clock();
        Ok(resumed)
    }

    /// Stop supervising without stopping the recordings' persisted state;
    /// the next rehydrate resumes them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.supervisors.lock().drain().map(|(_, h)| h.task).collect();
        log::info!("[Registry] Waiting for {} supervisor(s)", handles.len());
        for result in join_all(handles).await {
            if let Err(e) = result {
                log::warn!("[Registry] Supervisor task ended abnormally: {}", e);
            }
        }
    }
}
