// Recording modules

pub mod capture;
pub mod clock;
pub mod registry;
pub mod supervisor;
pub mod watchdog;

pub use capture::{CaptureLauncher, CaptureProcess, CaptureSpec, FfmpegLauncher};
pub use clock::{ClockState, SessionClock, TimeSource, WallClock};
pub use registry::{
    CameraOutcome, ElapsedSnapshot, RegistryEvent, RegistryOptions, SupervisorRegistry, SyncOutcome,
};
pub use supervisor::SupervisorConfig;

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::RecordingSummary;

/// Lifecycle state of one camera's recording session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No capture running
    Idle,
    /// Capture process being launched
    Starting,
    /// Capture running and healthy
    Recording,
    /// Capture running; displayed time is paused
    Paused,
    /// Capture went stale; relaunching
    Reconnecting,
    /// Capture being terminated on request
    Stopping,
    /// Gave up; needs a manual restart
    Failed,
}

impl SessionState {
    /// States in which a supervisor owns a live (or about to be live) capture
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Recording
                | SessionState::Paused
                | SessionState::Reconnecting
                | SessionState::Stopping
        )
    }

    /// Whether a start command may take this camera
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong, for the per-camera error history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Launch,
    StaleConnection,
    ReconnectFailed,
    ReconnectExhausted,
    StopFailed,
    Interrupted,
}

/// One entry in a session's recent error history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    /// Reconnect attempt this belongs to, if any
    #[serde(default)]
    pub attempt: Option<u32>,
}

/// Operator request to start recording one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub camera_id: String,
    pub camera_name: String,
    pub source_url: String,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub scenario_name: Option<String>,
}

/// Recording session of one camera.
///
/// Invariants: `Recording` implies `started_at` is set; `Idle` implies
/// `reconnect_attempts == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub camera_id: String,
    pub camera_name: String,
    pub source_url: String,
    pub state: SessionState,
    /// Start of the current continuous run; survives reconnects
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub scenario_name: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub recent_errors: VecDeque<ErrorEntry>,
    /// Identifies one continuous run across reconnects
    pub run_id: Uuid,
    /// File the current capture process writes to
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Every file written during this run, one per capture launch
    #[serde(default)]
    pub segments: Vec<PathBuf>,
    /// Pause accounting for this session
    #[serde(default)]
    pub clock: ClockState,
}

impl RecordingSession {
    pub fn new(request: &StartRequest) -> Self {
        Self {
            camera_id: request.camera_id.clone(),
            camera_name: request.camera_name.clone(),
            source_url: request.source_url.clone(),
            state: SessionState::Idle,
            started_at: None,
            scenario_id: request.scenario_id.clone(),
            scenario_name: request.scenario_name.clone(),
            last_activity_at: None,
            reconnect_attempts: 0,
            recent_errors: VecDeque::new(),
            run_id: Uuid::new_v4(),
            output_path: None,
            segments: Vec::new(),
            clock: ClockState::default(),
        }
    }

    /// History row for this run, if it ever actually started
    pub fn summary(&self, stopped_at: DateTime<Utc>) -> Option<RecordingSummary> {
        let started_at = self.started_at?;
        let clock = self.session_clock();
        Some(RecordingSummary {
            run_id: self.run_id,
            camera_id: self.camera_id.clone(),
            camera_name: self.camera_name.clone(),
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.scenario_name.clone(),
            started_at,
            stopped_at,
            elapsed_secs: clock.elapsed_seconds_at(stopped_at),
            paused_secs: clock.paused_seconds_at(stopped_at),
            segments: self
                .segments
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        })
    }

    /// Rebuild the request that would start this session again
    pub fn start_request(&self) -> StartRequest {
        StartRequest {
            camera_id: self.camera_id.clone(),
            camera_name: self.camera_name.clone(),
            source_url: self.source_url.clone(),
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.scenario_name.clone(),
        }
    }

    /// Append to the error ring, dropping the oldest entries beyond `limit`
    pub fn push_error(&mut self, entry: ErrorEntry, limit: usize) {
        self.recent_errors.push_back(entry);
        while self.recent_errors.len() > limit.max(1) {
            self.recent_errors.pop_front();
        }
    }

    pub fn session_clock(&self) -> SessionClock {
        SessionClock::from_state(self.clock.clone())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        let clock = self.session_clock();
        SessionStatus {
            camera_id: self.camera_id.clone(),
            camera_name: self.camera_name.clone(),
            state: self.state,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            reconnect_attempts: self.reconnect_attempts,
            recent_errors: self.recent_errors.iter().cloned().collect(),
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.scenario_name.clone(),
            output_path: self.output_path.clone(),
            elapsed_seconds: clock.elapsed_seconds_at(now),
            paused_seconds: clock.paused_seconds_at(now),
        }
    }
}

/// Status snapshot served to operator tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub camera_id: String,
    pub camera_name: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub recent_errors: Vec<ErrorEntry>,
    pub scenario_id: Option<String>,
    pub scenario_name: Option<String>,
    pub output_path: Option<PathBuf>,
    pub elapsed_seconds: u64,
    pub paused_seconds: u64,
}

/// Capture process could not be started
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("camera {camera_id} is already {state}")]
    AlreadyActive { camera_id: String, state: SessionState },

    #[error("failed to spawn capture process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("cannot prepare output path {path}: {source}")]
    OutputPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures surfaced to callers of the registry.
///
/// Stale connections and single failed relaunches never show up here; they
/// are retried inside the supervisor and only recorded in the error history.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("launch failed for {camera_id}: {source}")]
    Launch {
        camera_id: String,
        #[source]
        source: LaunchError,
    },

    #[error("camera {camera_id} gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { camera_id: String, attempts: u32 },

    #[error("capture for {camera_id} would not stop: {reason}")]
    StopFailed { camera_id: String, reason: String },

    #[error("camera {0} has no recording session")]
    NotFound(String),

    #[error("cannot {action} camera {camera_id} while {state}")]
    InvalidTransition {
        camera_id: String,
        state: SessionState,
        action: &'static str,
    },

    #[error("supervisor for {0} is not running")]
    Unavailable(String),
}

impl SupervisorError {
    pub fn camera_id(&self) -> &str {
        match self {
            SupervisorError::Launch { camera_id, .. }
            | SupervisorError::ReconnectExhausted { camera_id, .. }
            | SupervisorError::StopFailed { camera_id, .. }
            | SupervisorError::InvalidTransition { camera_id, .. } => camera_id,
            SupervisorError::NotFound(id) | SupervisorError::Unavailable(id) => id,
        }
    }
}
