// Configuration management for camkeeper

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recording::watchdog::WatchdogConfig;
use crate::recording::SupervisorConfig;
use crate::video::demux::{DemuxOptions, DEFAULT_BOUNDARY, DEFAULT_MAX_PART_BYTES, DEFAULT_MIN_FRAME_BYTES};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "CAMKEEPER_CONFIG";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Path where recordings are stored
    #[serde(default = "get_default_storage_path")]
    pub storage_path: PathBuf,

    /// SQLite file holding active sessions and recording history
    #[serde(default = "get_default_database_path")]
    pub database_path: PathBuf,

    /// Address the control API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the authoritative recording backend, if any
    #[serde(default)]
    pub backend_url: Option<String>,

    /// ffmpeg binary used for capture
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// Live stream (frame preview) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Boundary used when the camera does not announce one
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Bodies this size or smaller are not frames
    #[serde(default = "default_min_frame_bytes")]
    pub min_frame_bytes: usize,

    #[serde(default = "default_max_part_bytes")]
    pub max_part_bytes: usize,

    /// How long to wait for a frame before giving up on a preview
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            min_frame_bytes: default_min_frame_bytes(),
            max_part_bytes: default_max_part_bytes(),
            frame_timeout_ms: default_frame_timeout_ms(),
        }
    }
}

impl StreamConfig {
    pub fn demux_options(&self) -> DemuxOptions {
        DemuxOptions {
            boundary: self.boundary.clone(),
            min_frame_bytes: self.min_frame_bytes,
            max_part_bytes: self.max_part_bytes,
            ..Default::default()
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            database_path: get_default_database_path(),
            bind_addr: default_bind_addr(),
            backend_url: None,
            ffmpeg_path: default_ffmpeg_path(),
            supervisor: SupervisorConfig::default(),
            stream: StreamConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Config rejected by validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("staleTimeoutMs ({stale}) must be at least healthCheckIntervalMs ({interval})")]
    StaleBeforeProbe { stale: u64, interval: u64 },
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(config_path, contents)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.health_check_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "healthCheckIntervalMs",
            });
        }
        if s.stale_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "staleTimeoutMs",
            });
        }
        if s.recent_error_limit == 0 {
            return Err(ConfigError::Zero {
                field: "recentErrorLimit",
            });
        }
        if s.stale_timeout_ms < s.health_check_interval_ms {
            return Err(ConfigError::StaleBeforeProbe {
                stale: s.stale_timeout_ms,
                interval: s.health_check_interval_ms,
            });
        }
        Ok(())
    }

    /// Apply a partial update from the control API. Nothing changes if the
    /// result would be invalid.
    pub fn apply(&mut self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        let mut next = self.clone();
        let s = &mut next.supervisor;
        if let Some(v) = update.auto_reconnect {
            s.auto_reconnect = v;
        }
        if let Some(v) = update.max_reconnect_attempts {
            s.max_reconnect_attempts = v;
        }
        if let Some(v) = update.reconnect_delay_ms {
            s.reconnect_delay_ms = v;
        }
        if let Some(v) = update.exponential_backoff {
            s.exponential_backoff = v;
        }
        if let Some(v) = update.max_reconnect_delay_ms {
            s.max_reconnect_delay_ms = v;
        }
        if let Some(v) = update.health_check_interval_ms {
            s.health_check_interval_ms = v;
        }
        if let Some(v) = update.stale_timeout_ms {
            s.stale_timeout_ms = v;
        }
        if let Some(v) = update.stop_timeout_ms {
            s.stop_timeout_ms = v;
        }
        if let Some(v) = update.recent_error_limit {
            s.recent_error_limit = v;
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn view(&self) -> ConfigView {
        let s = &self.supervisor;
        ConfigView {
            storage_path: self.storage_path.clone(),
            bind_addr: self.bind_addr.clone(),
            backend_url: self.backend_url.clone(),
            auto_reconnect: s.auto_reconnect,
            max_reconnect_attempts: s.max_reconnect_attempts,
            reconnect_delay_ms: s.reconnect_delay_ms,
            exponential_backoff: s.exponential_backoff,
            max_reconnect_delay_ms: s.max_reconnect_delay_ms,
            health_check_interval_ms: s.health_check_interval_ms,
            stale_timeout_ms: s.stale_timeout_ms,
            stop_timeout_ms: s.stop_timeout_ms,
            recent_error_limit: s.recent_error_limit,
        }
    }
}

/// Partial supervisor settings accepted by `PUT /api/config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub auto_reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub exponential_backoff: Option<bool>,
    pub max_reconnect_delay_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub stale_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub recent_error_limit: Option<usize>,
}

/// Settings as served by `GET /api/config`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub storage_path: PathBuf,
    pub bind_addr: String,
    pub backend_url: Option<String>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_reconnect_delay_ms: u64,
    pub health_check_interval_ms: u64,
    pub stale_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub recent_error_limit: usize,
}

/// Resolve the config file: explicit argument, then environment, then the
/// platform config directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(get_default_config_path)
}

/// Get the default storage path for recordings
fn get_default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Camkeeper")
}

fn get_default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camkeeper")
        .join("sessions.db")
}

/// Get the config file path
fn get_default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("camkeeper")
        .join("config.toml")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8740".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_boundary() -> String {
    DEFAULT_BOUNDARY.to_string()
}

fn default_min_frame_bytes() -> usize {
    DEFAULT_MIN_FRAME_BYTES
}

fn default_max_part_bytes() -> usize {
    DEFAULT_MAX_PART_BYTES
}

fn default_frame_timeout_ms() -> u64 {
    10_000
}
