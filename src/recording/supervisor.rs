// Per-camera recording supervisor
//
// One tokio task per camera owns that camera's capture process. Every
// transition for the camera (probe, reconnect, stop, pause) happens inside
// this task, in the order commands arrive, so a probe can never race a stop.
// The shared session entry is only locked for short synchronous updates and
// never across an await.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::capture::{CaptureLauncher, CaptureProcess, CaptureSpec};
use super::clock::TimeSource;
use super::registry::RegistryEvent;
use super::{ErrorEntry, ErrorKind, LaunchError, RecordingSession, SessionState, SupervisorError};
use crate::session::{metadata, SessionStore};

/// Probe cadence while a relaunched capture has not shown a frame yet
const FIRST_FRAME_POLL: Duration = Duration::from_millis(250);

/// Health and reconnect policy, shared by all supervisors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Relaunch stale captures automatically
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Consecutive failed relaunches before giving up (0 = never give up)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Double the delay per attempt, capped at `max_reconnect_delay_ms`
    #[serde(default)]
    pub exponential_backoff: bool,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Silence longer than this marks the capture stale
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,

    /// Grace period for the capture to finish its file on stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Entries kept in each session's error history
    #[serde(default = "default_recent_error_limit")]
    pub recent_error_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    60_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_stale_timeout_ms() -> u64 {
    60_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_recent_error_limit() -> usize {
    10
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            exponential_backoff: false,
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            stale_timeout_ms: default_stale_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            recent_error_limit: default_recent_error_limit(),
        }
    }
}

impl SupervisorConfig {
    /// Wait before relaunch number `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_delay_ms;
        if !self.exponential_backoff {
            return Duration::from_millis(base);
        }
        let shift = attempt.saturating_sub(1).min(20);
        let delay = base.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_reconnect_delay_ms.max(base)))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// True once `attempts` relaunches have been spent
    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_reconnect_attempts > 0 && attempts >= self.max_reconnect_attempts
    }
}

/// Everything a supervisor task needs from its registry
#[derive(Clone)]
pub(crate) struct SupervisorContext {
    pub entry: Arc<Mutex<RecordingSession>>,
    pub config: Arc<RwLock<SupervisorConfig>>,
    pub launcher: Arc<dyn CaptureLauncher>,
    pub store: Arc<SessionStore>,
    pub time: Arc<dyn TimeSource>,
    pub events: broadcast::Sender<RegistryEvent>,
    pub storage_path: PathBuf,
    pub shutdown: CancellationToken,
}

impl SupervisorContext {
    fn camera_id(&self) -> String {
        self.entry.lock().camera_id.clone()
    }

    /// Reserve a fresh output file and launch the capture into it. The
    /// session's `output_path` follows the latest reservation.
    async fn launch(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(CaptureSpec, Box<dyn CaptureProcess>), LaunchError> {
        let spec = {
            let mut session = self.entry.lock();
            let output_path = metadata::reserve_output_path(
                &self.storage_path,
                &session.camera_id,
                &session.camera_name,
                session.scenario_name.as_deref(),
                now,
            )
            .map_err(|source| LaunchError::OutputPath {
                path: self.storage_path.clone(),
                source,
            })?;
            session.output_path = Some(output_path.clone());
            CaptureSpec {
                camera_id: session.camera_id.clone(),
                camera_name: session.camera_name.clone(),
                source_url: session.source_url.clone(),
                output_path,
            }
        };

        match self.launcher.launch(&spec).await {
            Ok(process) => Ok((spec, process)),
            Err(e) => {
                // Nothing was written into the reservation
                if let Err(rm) = std::fs::remove_file(&spec.output_path) {
                    log::debug!("[Supervisor] Could not remove {}: {}", spec.output_path.display(), rm);
                }
                Err(e)
            }
        }
    }

    fn persist(&self) {
        let snapshot = self.entry.lock().clone();
        if let Err(e) = self.store.upsert(&snapshot) {
            log::warn!("[Supervisor] Failed to persist {}: {}", snapshot.camera_id, e);
        }
    }

    fn record_error(&self, kind: ErrorKind, message: String, attempt: Option<u32>) {
        let limit = self.config.read().recent_error_limit;
        let entry = ErrorEntry {
            at: self.time.now(),
            kind,
            message,
            attempt,
        };
        self.entry.lock().push_error(entry, limit);
    }

    fn set_state(&self, state: SessionState) {
        let camera_id = {
            let mut session = self.entry.lock();
            session.state = state;
            session.camera_id.clone()
        };
        self.persist();
        let _ = self.events.send(RegistryEvent::StateChanged { camera_id, state });
    }
}

/// Messages from the registry to one supervisor
pub(crate) enum Command {
    Stop(oneshot::Sender<Result<(), SupervisorError>>),
    Pause(oneshot::Sender<Result<(), SupervisorError>>),
    Resume(oneshot::Sender<Result<(), SupervisorError>>),
    /// Run a health probe now instead of at the next tick
    Probe,
}

/// Registry-side handle to a running supervisor task
pub(crate) struct SupervisorHandle {
    pub commands: mpsc::Sender<Command>,
    pub task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Launch the capture for a session in `Starting`. On success the session
/// is `Recording` and a supervisor task owns the process; on failure the
/// session is `Failed` and no task exists.
pub(crate) async fn start(ctx: SupervisorContext) -> Result<SupervisorHandle, SupervisorError> {
    let now = ctx.time.now();

    match ctx.launch(now).await {
        Ok((spec, process)) => {
            {
                let mut session = ctx.entry.lock();
                session.started_at = Some(now);
                session.last_activity_at = Some(now);
                session.reconnect_attempts = 0;
                session.segments = vec![spec.output_path.clone()];
                let mut clock = session.session_clock();
                clock.start_at(now);
                session.clock = clock.state().clone();
            }
            ctx.set_state(SessionState::Recording);
            log::info!("[Supervisor] {} recording to {}", spec.camera_id, spec.output_path.display());

            Ok(spawn(ctx, Some(process), SessionState::Recording, Phase::Watch))
        }
        Err(source) => {
            let camera_id = ctx.camera_id();
            log::error!("[Supervisor] {} failed to launch: {}", camera_id, source);
            ctx.record_error(ErrorKind::Launch, source.to_string(), None);
            ctx.set_state(SessionState::Failed);
            let _ = ctx.events.send(RegistryEvent::LaunchFailed {
                camera_id: camera_id.clone(),
                reason: source.to_string(),
            });
            Err(SupervisorError::Launch { camera_id, source })
        }
    }
}

/// Take over a session whose capture is not running in this process
/// (rehydrated after restart, or adopted from the backend). Relaunches
/// immediately without counting an attempt; the session returns to
/// `resume_state` once the new capture shows its first frame.
pub(crate) fn spawn_resumed(ctx: SupervisorContext, resume_state: SessionState) -> SupervisorHandle {
    ctx.set_state(SessionState::Reconnecting);
    spawn(
        ctx,
        None,
        resume_state,
        Phase::Relaunch {
            delay: Duration::ZERO,
            counted: false,
        },
    )
}

fn spawn(
    ctx: SupervisorContext,
    process: Option<Box<dyn CaptureProcess>>,
    resume_state: SessionState,
    phase: Phase,
) -> SupervisorHandle {
    let (tx, rx) = mpsc::channel(16);
    let camera_id = ctx.camera_id();
    let supervisor = Supervisor {
        camera_id,
        ctx,
        commands: rx,
        process,
        resume_state,
        awaiting_frame: false,
        last_seen_frame: None,
    };
    let task = tokio::spawn(supervisor.run(phase));
    SupervisorHandle { commands: tx, task }
}

enum Phase {
    /// Capture running; probe on every tick
    Watch,
    /// Capture gone; relaunch after `delay`
    Relaunch { delay: Duration, counted: bool },
    Done,
}

struct Supervisor {
    camera_id: String,
    ctx: SupervisorContext,
    commands: mpsc::Receiver<Command>,
    process: Option<Box<dyn CaptureProcess>>,
    /// State to return to once a relaunched capture shows a frame
    resume_state: SessionState,
    /// Set by a relaunch, cleared by the first frame that follows it
    awaiting_frame: bool,
    last_seen_frame: Option<DateTime<Utc>>,
}

impl Supervisor {
    async fn run(mut self, mut phase: Phase) {
        loop {
            phase = match phase {
                Phase::Watch => self.watch().await,
                Phase::Relaunch { delay, counted } => self.relaunch(delay, counted).await,
                Phase::Done => break,
            };
        }
        log::debug!("[Supervisor] {} task finished", self.camera_id);
    }

    async fn watch(&mut self) -> Phase {
        let shutdown = self.ctx.shutdown.clone();
        let mut period = self.probe_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return self.on_shutdown().await,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return self.on_shutdown().await;
                    };
                    if let Some(next) = self.handle_command(cmd).await {
                        return next;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(next) = self.probe().await {
                        return next;
                    }
                }
            }

            let current = self.probe_period();
            if current != period {
                log::debug!("[Supervisor] {} probe interval now {:?}", self.camera_id, current);
                period = current;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }

    fn probe_period(&self) -> Duration {
        let period = self.ctx.config.read().health_check_interval();
        if self.awaiting_frame {
            period.min(FIRST_FRAME_POLL)
        } else {
            period
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Option<Phase> {
        match cmd {
            Command::Stop(reply) => {
                let result = self.stop().await;
                let stopped = result.is_ok();
                let _ = reply.send(result);
                stopped.then_some(Phase::Done)
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
                None
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume());
                None
            }
            Command::Probe => self.probe().await,
        }
    }

    /// Check the capture's liveness. Returns the next phase if it went stale.
    async fn probe(&mut self) -> Option<Phase> {
        let now = self.ctx.time.now();
        let config = self.ctx.config.read().clone();
        let process = self.process.as_mut()?;

        if let Some(at) = process.last_frame_at() {
            if self.last_seen_frame.map_or(true, |prev| at > prev) {
                self.last_seen_frame = Some(at);
                {
                    let mut session = self.ctx.entry.lock();
                    if session.last_activity_at.map_or(true, |prev| at > prev) {
                        session.last_activity_at = Some(at);
                    }
                    if self.awaiting_frame {
                        session.reconnect_attempts = 0;
                    }
                }
                if self.awaiting_frame {
                    self.awaiting_frame = false;
                    // Persists as a side effect
                    self.ctx.set_state(self.resume_state);
                    log::info!(
                        "[Supervisor] {} receiving frames again, back to {}",
                        self.camera_id,
                        self.resume_state
                    );
                } else {
                    self.ctx.persist();
                }
            }
        }

        let exited = process.has_exited();
        let (last_activity, attempts) = {
            let session = self.ctx.entry.lock();
            (session.last_activity_at, session.reconnect_attempts)
        };
        let idle_ms = last_activity
            .map(|at| (now - at).num_milliseconds())
            .unwrap_or(i64::MAX);

        if !exited && idle_ms <= config.stale_timeout_ms as i64 {
            log::debug!(
                "[Supervisor] {} healthy ({} frames, idle {}ms)",
                self.camera_id,
                process.frames_written(),
                idle_ms
            );
            return None;
        }

        let message = if exited {
            "capture process exited".to_string()
        } else {
            format!("no frames for {}s", idle_ms / 1000)
        };
        log::warn!("[Supervisor] {} stale: {}", self.camera_id, message);
        let attempt = self.awaiting_frame.then_some(attempts);
        self.ctx.record_error(ErrorKind::StaleConnection, message.clone(), attempt);

        self.terminate_quietly().await;

        if !config.auto_reconnect {
            return Some(self.fail(&message));
        }
        if config.attempts_exhausted(attempts) {
            return Some(self.exhaust(attempts));
        }

        let state = self.ctx.entry.lock().state;
        if matches!(state, SessionState::Recording | SessionState::Paused) {
            self.resume_state = state;
        }
        self.ctx.set_state(SessionState::Reconnecting);

        Some(Phase::Relaunch {
            delay: config.reconnect_delay(attempts + 1),
            counted: true,
        })
    }

    async fn relaunch(&mut self, delay: Duration, counted: bool) -> Phase {
        let shutdown = self.ctx.shutdown.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return self.on_shutdown().await,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return self.on_shutdown().await;
                    };
                    match cmd {
                        Command::Stop(reply) => {
                            let result = self.stop().await;
                            let stopped = result.is_ok();
                            let _ = reply.send(result);
                            if stopped {
                                return Phase::Done;
                            }
                        }
                        Command::Pause(reply) => {
                            let _ = reply.send(Err(self.invalid("pause")));
                        }
                        Command::Resume(reply) => {
                            let _ = reply.send(Err(self.invalid("resume")));
                        }
                        Command::Probe => {}
                    }
                }
                _ = &mut sleep => break,
            }
        }

        let attempt = if counted {
            let mut session = self.ctx.entry.lock();
            session.reconnect_attempts += 1;
            session.reconnect_attempts
        } else {
            self.ctx.entry.lock().reconnect_attempts
        };
        log::info!("[Supervisor] {} relaunching (attempt {})", self.camera_id, attempt);

        let now = self.ctx.time.now();
        match self.ctx.launch(now).await {
            Ok((spec, process)) => {
                self.process = Some(process);
                self.awaiting_frame = true;
                self.last_seen_frame = None;
                {
                    let mut session = self.ctx.entry.lock();
                    session.last_activity_at = Some(now);
                    session.segments.push(spec.output_path.clone());
                    if self.resume_state == SessionState::Paused && session.clock.pause_start.is_none() {
                        let mut clock = session.session_clock();
                        clock.pause_at(now);
                        session.clock = clock.state().clone();
                    }
                }
                self.ctx.persist();
                log::info!(
                    "[Supervisor] {} relaunched -> {}, waiting for first frame",
                    self.camera_id,
                    spec.output_path.display()
                );
                Phase::Watch
            }
            Err(e) => {
                log::error!("[Supervisor] {} relaunch failed: {}", self.camera_id, e);
                self.ctx
                    .record_error(ErrorKind::ReconnectFailed, e.to_string(), Some(attempt));
                self.ctx.persist();

                let config = self.ctx.config.read().clone();
                if config.attempts_exhausted(attempt) {
                    return self.exhaust(attempt);
                }
                Phase::Relaunch {
                    delay: config.reconnect_delay(attempt + 1),
                    counted: true,
                }
            }
        }
    }

    /// Stop the capture. The session is only released once the process is
    /// confirmed gone; otherwise the pre-stop state comes back.
    async fn stop(&mut self) -> Result<(), SupervisorError> {
        let prior = self.ctx.entry.lock().state;
        self.ctx.set_state(SessionState::Stopping);
        log::info!("[Supervisor] {} stopping", self.camera_id);

        let timeout = self.ctx.config.read().stop_timeout();
        let result = match self.process.as_mut() {
            Some(process) => process.terminate(timeout).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.process = None;
                let now = self.ctx.time.now();
                let summary = {
                    let mut session = self.ctx.entry.lock();
                    let summary = session.summary(now);
                    session.state = SessionState::Idle;
                    session.reconnect_attempts = 0;
                    session.clock = Default::default();
                    summary
                };

                if let Err(e) = self.ctx.store.remove(&self.camera_id) {
                    log::warn!("[Supervisor] Failed to clear {} from store: {}", self.camera_id, e);
                }
                if let Some(summary) = summary {
                    if let Err(e) = self.ctx.store.record_completed(&summary) {
                        log::warn!("[Supervisor] Failed to record run for {}: {}", self.camera_id, e);
                    }
                }

                let _ = self.ctx.events.send(RegistryEvent::StateChanged {
                    camera_id: self.camera_id.clone(),
                    state: SessionState::Idle,
                });
                log::info!("[Supervisor] {} stopped", self.camera_id);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                log::error!("[Supervisor] {} would not stop: {}", self.camera_id, reason);
                self.ctx.record_error(ErrorKind::StopFailed, reason.clone(), None);
                self.ctx.set_state(prior);
                let _ = self.ctx.events.send(RegistryEvent::StopFailed {
                    camera_id: self.camera_id.clone(),
                    reason: reason.clone(),
                });
                Err(SupervisorError::StopFailed {
                    camera_id: self.camera_id.clone(),
                    reason,
                })
            }
        }
    }

    fn pause(&mut self) -> Result<(), SupervisorError> {
        let now = self.ctx.time.now();
        let changed = {
            let mut session = self.ctx.entry.lock();
            match session.state {
                SessionState::Paused => false,
                SessionState::Recording => {
                    let mut clock = session.session_clock();
                    clock.pause_at(now);
                    session.clock = clock.state().clone();
                    true
                }
                state => return Err(self.invalid_in(state, "pause")),
            }
        };
        if changed {
            self.resume_state = SessionState::Paused;
            self.ctx.set_state(SessionState::Paused);
            log::info!("[Supervisor] {} paused", self.camera_id);
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), SupervisorError> {
        let now = self.ctx.time.now();
        let changed = {
            let mut session = self.ctx.entry.lock();
            match session.state {
                SessionState::Recording => false,
                SessionState::Paused => {
                    let mut clock = session.session_clock();
                    clock.resume_at(now);
                    session.clock = clock.state().clone();
                    true
                }
                state => return Err(self.invalid_in(state, "resume")),
            }
        };
        if changed {
            self.resume_state = SessionState::Recording;
            self.ctx.set_state(SessionState::Recording);
            log::info!("[Supervisor] {} resumed", self.camera_id);
        }
        Ok(())
    }

    fn exhaust(&mut self, attempts: u32) -> Phase {
        let message = format!("gave up after {} reconnect attempts", attempts);
        self.ctx
            .record_error(ErrorKind::ReconnectExhausted, message.clone(), Some(attempts));
        let _ = self.ctx.events.send(RegistryEvent::ReconnectExhausted {
            camera_id: self.camera_id.clone(),
            attempts,
        });
        self.fail(&message)
    }

    /// Terminal failure. The session stays in the map as `Failed` until the
    /// operator stops or restarts it.
    fn fail(&mut self, reason: &str) -> Phase {
        log::error!("[Supervisor] {} failed: {}", self.camera_id, reason);
        self.process = None;
        self.ctx.set_state(SessionState::Failed);
        Phase::Done
    }

    /// Daemon shutdown: let the capture finish its file but keep the
    /// persisted session so the next start picks it back up.
    async fn on_shutdown(&mut self) -> Phase {
        self.terminate_quietly().await;
        log::info!("[Supervisor] {} detached for shutdown", self.camera_id);
        Phase::Done
    }

    async fn terminate_quietly(&mut self) {
        if let Some(mut process) = self.process.take() {
            let timeout = self.ctx.config.read().stop_timeout();
            if let Err(e) = process.terminate(timeout).await {
                log::warn!("[Supervisor] {} old capture did not exit: {}", self.camera_id, e);
            }
        }
    }

    fn invalid(&self, action: &'static str) -> SupervisorError {
        let state = self.ctx.entry.lock().state;
        self.invalid_in(state, action)
    }

    fn invalid_in(&self, state: SessionState, action: &'static str) -> SupervisorError {
        SupervisorError::InvalidTransition {
            camera_id: self.camera_id.clone(),
            state,
            action,
        }
    }
}
