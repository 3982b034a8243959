// External capture process
//
// Each recording session writes its camera stream to disk through an ffmpeg
// child process. The supervisor only sees the two traits below, so tests can
// script launches and frame activity without spawning anything.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::LaunchError;

/// What to record and where
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSpec {
    pub camera_id: String,
    pub camera_name: String,
    pub source_url: String,
    pub output_path: PathBuf,
}

/// Starts capture processes
#[async_trait]
pub trait CaptureLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>, LaunchError>;
}

/// A running capture, owned by exactly one supervisor
#[async_trait]
pub trait CaptureProcess: Send {
    /// Wall-clock time the process last reported a new frame
    fn last_frame_at(&self) -> Option<DateTime<Utc>>;

    fn frames_written(&self) -> u64;

    /// True once the process has exited on its own
    fn has_exited(&mut self) -> bool;

    /// Ask the process to finish its file, killing it after `timeout`.
    /// Ok means the process is confirmed gone.
    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<()>;
}

/// Launches `ffmpeg -i <url> -c copy <file>.mkv`
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn command(&self, spec: &CaptureSpec) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostats"])
            .args(["-progress", "pipe:1"])
            .arg("-i")
            .arg(&spec.source_url)
            // -y replaces only the empty file reserved for this launch
            .args(["-c", "copy", "-f", "matroska", "-y"])
            .arg(&spec.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl CaptureLauncher for FfmpegLauncher {
    async fn launch(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureProcess>, LaunchError> {
        if let Some(parent) = spec.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LaunchError::OutputPath {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut child = self.command(spec).spawn().map_err(LaunchError::Spawn)?;
        log::info!(
            "[Capture] {} -> {} (pid {:?})",
            spec.camera_id,
            spec.output_path.display(),
            child.id()
        );

        let progress = Arc::new(Progress::default());

        if let Some(stdout) = child.stdout.take() {
            let progress = progress.clone();
            let camera_id = spec.camera_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    progress.observe(&line, Utc::now());
                }
                log::debug!("[Capture] {} progress pipe closed", camera_id);
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let progress = progress.clone();
            let camera_id = spec.camera_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        log::debug!("[Capture] {}: {}", camera_id, line);
                        *progress.last_error.lock() = Some(line);
                    }
                }
            });
        }

        Ok(Box::new(FfmpegProcess {
            camera_id: spec.camera_id.clone(),
            child,
            progress,
        }))
    }
}

/// Frame activity parsed from `-progress` output
#[derive(Debug, Default)]
struct Progress {
    frames: AtomicU64,
    /// Milliseconds since the epoch; 0 until the first frame
    last_frame_ms: AtomicI64,
    ended: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Progress {
    /// Feed one `key=value` line. Only a growing `frame=` counter counts as
    /// activity; ffmpeg repeats the block even when the input has stalled.
    fn observe(&self, line: &str, now: DateTime<Utc>) {
        let Some((key, value)) = line.trim().split_once('=') else {
            return;
        };
        match key {
            "frame" => {
                if let Ok(n) = value.trim().parse::<u64>() {
                    let previous = self.frames.fetch_max(n, Ordering::Relaxed);
                    if n > previous {
                        self.last_frame_ms.store(now.timestamp_millis(), Ordering::Relaxed);
                    }
                }
            }
            "progress" if value.trim() == "end" => {
                self.ended.store(true, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        match self.last_frame_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

struct FfmpegProcess {
    camera_id: String,
    child: Child,
    progress: Arc<Progress>,
}

#[async_trait]
impl CaptureProcess for FfmpegProcess {
    fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.progress.last_frame_at()
    }

    fn frames_written(&self) -> u64 {
        self.progress.frames.load(Ordering::Relaxed)
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let reason = self.progress.last_error.lock().clone();
                log::warn!(
                    "[Capture] {} exited with {} ({})",
                    self.camera_id,
                    status,
                    reason.as_deref().unwrap_or("no output")
                );
                true
            }
            Ok(None) => self.progress.ended.load(Ordering::Relaxed),
            Err(e) => {
                log::warn!("[Capture] {} status unknown: {}", self.camera_id, e);
                false
            }
        }
    }

    async fn terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        // ffmpeg finalizes the container when it reads `q`
        if let Some(mut stdin) = self.child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n").await {
                log::debug!("[Capture] {} stdin closed: {}", self.camera_id, e);
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                log::info!("[Capture] {} finished ({})", self.camera_id, status?);
                Ok(())
            }
            Err(_) => {
                log::warn!(
                    "[Capture] {} ignored quit after {:?}, killing",
                    self.camera_id,
                    timeout
                );
                self.child.start_kill()?;
                match tokio::time::timeout(timeout, self.child.wait()).await {
                    Ok(status) => status.map(|_| ()),
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("process for {} did not exit after kill", self.camera_id),
                    )),
                }
            }
        }
    }
}
