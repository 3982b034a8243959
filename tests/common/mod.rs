// Shared fakes for the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use camkeeper_lib::backend::{BackendError, BackendRecording, RecordingBackend};
use camkeeper_lib::recording::registry::RegistryOptions;
use camkeeper_lib::recording::{
    CaptureLauncher, CaptureProcess, CaptureSpec, LaunchError, StartRequest, SupervisorConfig,
    SupervisorRegistry, TimeSource,
};
use camkeeper_lib::session::SessionStore;

/// Wall-clock time that moves with tokio's (paused) clock
pub struct TokioTime {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioTime {
    pub fn new() -> Self {
        Self {
            base: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for TokioTime {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
    }
}

/// How one scripted launch behaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    /// Launches and reports a fresh frame whenever asked
    Live,
    /// Launches but never produces a frame
    Silent,
    /// Spawn fails
    FailLaunch,
}

/// Capture launcher driven by per-camera scripts. The last behavior of a
/// script repeats forever; cameras without a script are `Live`.
pub struct FakeLauncher {
    time: Arc<dyn TimeSource>,
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    launches: Mutex<Vec<CaptureSpec>>,
    pub stop_fails: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            scripts: Mutex::new(HashMap::new()),
            launches: Mutex::new(Vec::new()),
            stop_fails: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn script(&self, camera_id: &str, behaviors: &[Behavior]) {
        self.scripts
            .lock()
            .insert(camera_id.to_string(), behaviors.iter().copied().collect());
    }

    pub fn launches_for(&self, camera_id: &str) -> usize {
        self.launches
            .lock()
            .iter()
            .filter(|s| s.camera_id == camera_id)
            .count()
    }

    pub fn launched_paths(&self, camera_id: &str) -> Vec<std::path::PathBuf> {
        self.launches
            .lock()
            .iter()
            .filter(|s| s.camera_id == camera_id)
            .map(|s| s.output_path.clone())
            .collect()
    }

    fn next_behavior(&self, camera_id: &str) -> Behavior {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(camera_id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(Behavior::Live),
            Some(script) => script.front().copied().unwrap_or(Behavior::Live),
            None => Behavior::Live,
        }
    }
}

#[async_trait]
impl CaptureLauncher for FakeLauncher {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>, LaunchError> {
        self.launches.lock().push(spec.clone());
        match self.next_behavior(&spec.camera_id) {
            Behavior::FailLaunch => Err(LaunchError::Spawn(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "camera unreachable",
            ))),
            behavior => Ok(Box::new(FakeProcess {
                live: behavior == Behavior::Live,
                time: self.time.clone(),
                stop_fails: self.stop_fails.clone(),
            })),
        }
    }
}

struct FakeProcess {
    live: bool,
    time: Arc<dyn TimeSource>,
    stop_fails: Arc<AtomicBool>,
}

#[async_trait]
impl CaptureProcess for FakeProcess {
    fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.live.then(|| self.time.now())
    }

    fn frames_written(&self) -> u64 {
        0
    }

    fn has_exited(&mut self) -> bool {
        false
    }

    async fn terminate(&mut self, _timeout: Duration) -> std::io::Result<()> {
        if self.stop_fails.load(Ordering::SeqCst) {
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "process ignored kill"))
        } else {
            Ok(())
        }
    }
}

/// Backend whose answers the test sets directly
#[derive(Default)]
pub struct FakeBackend {
    pub records: Mutex<HashMap<String, BackendRecording>>,
    pub earliest: Mutex<Option<DateTime<Utc>>>,
    pub unavailable: AtomicBool,
}

impl FakeBackend {
    pub fn set(&self, camera_id: &str, record: BackendRecording) {
        self.records.lock().insert(camera_id.to_string(), record);
    }
}

#[async_trait]
impl RecordingBackend for FakeBackend {
    async fn recording_status(&self, camera_id: &str) -> Result<BackendRecording, BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Disabled);
        }
        Ok(self.records.lock().get(camera_id).cloned().unwrap_or_default())
    }

    async fn earliest_active_start(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Disabled);
        }
        Ok(*self.earliest.lock())
    }
}

pub struct Harness {
    pub registry: Arc<SupervisorRegistry>,
    pub launcher: Arc<FakeLauncher>,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<SessionStore>,
    pub time: Arc<dyn TimeSource>,
    pub dir: tempfile::TempDir,
}

pub fn harness(config: SupervisorConfig) -> Harness {
    harness_with(config, Arc::new(TokioTime::new()), SessionStore::open_in_memory().unwrap())
}

pub fn harness_with(config: SupervisorConfig, time: Arc<dyn TimeSource>, store: SessionStore) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::new(time.clone()));
    let backend = Arc::new(FakeBackend::default());
    let store = Arc::new(store);

    let registry = SupervisorRegistry::new(RegistryOptions {
        launcher: launcher.clone(),
        backend: backend.clone(),
        store: store.clone(),
        time: time.clone(),
        config,
        storage_path: dir.path().to_path_buf(),
    });

    Harness {
        registry,
        launcher,
        backend,
        store,
        time,
        dir,
    }
}

pub fn camera(id: &str) -> StartRequest {
    StartRequest {
        camera_id: id.to_string(),
        camera_name: format!("Camera {}", id),
        source_url: format!("http://{}.local/stream", id),
        scenario_id: None,
        scenario_name: None,
    }
}

/// Fast probe settings so tests need little simulated time
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        health_check_interval_ms: 1_000,
        stale_timeout_ms: 1_500,
        reconnect_delay_ms: 100,
        stop_timeout_ms: 100,
        ..Default::default()
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
