// Suspension watchdog
//
// Ticks on tokio's clock and compares consecutive wall-clock readings. A gap
// much larger than the tick means the whole process was not scheduled
// (sleep, SIGSTOP, heavy throttling), so the registry is told to resync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::clock::TimeSource;
use super::registry::SupervisorRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Extra wall-clock time beyond one tick that counts as a suspension
    #[serde(default = "default_suspend_threshold_ms")]
    pub suspend_threshold_ms: u64,
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_suspend_threshold_ms() -> u64 {
    5_000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            suspend_threshold_ms: default_suspend_threshold_ms(),
        }
    }
}

/// Returns the gap if `previous -> now` is long enough to mean a suspension
pub fn detect_suspension(
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &WatchdogConfig,
) -> Option<Duration> {
    let gap = (now - previous).num_milliseconds();
    let limit = (config.tick_ms + config.suspend_threshold_ms) as i64;
    (gap > limit).then(|| Duration::from_millis(gap as u64))
}

pub fn spawn(
    registry: Arc<SupervisorRegistry>,
    time: Arc<dyn TimeSource>,
    config: WatchdogConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous = time.now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = time.now();
            if let Some(gap) = detect_suspension(previous, now, &config) {
                log::warn!("[Watchdog] Process was suspended for {:?}, resyncing", gap);
                let snapshot = registry.on_foreground().await;
                log::info!(
                    "[Watchdog] Elapsed {} across {} active session(s)",
                    snapshot.formatted,
                    snapshot.active_sessions
                );
            }
            previous = now;
        }
        log::debug!("[Watchdog] Stopped");
    })
}
