// Session clock - elapsed and paused time from wall-clock timestamps
//
// Nothing here counts ticks. Every duration is recomputed from the stored
// timestamps and the current time, so the answer is the same whether the
// clock was polled every second or not at all for an hour (suspended
// laptop, throttled process, stopped container).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Source of wall-clock time.
///
/// Production code uses [`WallClock`]; tests substitute a source that moves
/// with tokio's paused clock.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system's real-time clock
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persisted clock fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub recording_start: Option<DateTime<Utc>>,
    pub pause_start: Option<DateTime<Utc>>,
    /// Total of all completed pauses. Never decreases while not paused.
    pub accumulated_paused_ms: i64,
}

/// Timestamp-based recording timer with pause support
#[derive(Debug, Clone, Default)]
pub struct SessionClock {
    state: ClockState,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ClockState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.recording_start.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.state.pause_start.is_some()
    }

    pub fn recording_start(&self) -> Option<DateTime<Utc>> {
        self.state.recording_start
    }

    pub fn start(&mut self) {
        self.start_at(Utc::now());
    }

    pub fn start_at(&mut self, now: DateTime<Utc>) {
        self.state = ClockState {
            recording_start: Some(now),
            pause_start: None,
            accumulated_paused_ms: 0,
        };
    }

    /// Begin a pause. Returns false (and changes nothing) if already paused
    /// or not running.
    pub fn pause(&mut self) -> bool {
        self.pause_at(Utc::now())
    }

    pub fn pause_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.recording_start.is_none() || self.state.pause_start.is_some() {
            return false;
        }
        self.state.pause_start = Some(now);
        true
    }

    /// End the current pause, folding its length into the accumulated total.
    pub fn resume(&mut self) -> bool {
        self.resume_at(Utc::now())
    }

    pub fn resume_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state.pause_start.take() {
            Some(pause_start) => {
                self.state.accumulated_paused_ms += (now - pause_start).num_milliseconds().max(0);
                true
            }
            None => false,
        }
    }

    pub fn stop(&mut self) {
        self.state = ClockState::default();
    }

    /// Replace the start reference with one from a trusted source.
    ///
    /// Pause accounting is kept; only the origin moves.
    pub fn resync(&mut self, authoritative_start: DateTime<Utc>) {
        if self.state.recording_start != Some(authoritative_start) {
            log::debug!(
                "[Clock] Resync start {:?} -> {}",
                self.state.recording_start,
                authoritative_start
            );
        }
        self.state.recording_start = Some(authoritative_start);
    }

    pub fn elapsed_ms_at(&self, now: DateTime<Utc>) -> i64 {
        let Some(start) = self.state.recording_start else {
            return 0;
        };
        let total = (now - start).num_milliseconds();
        (total - self.paused_ms_at(now)).max(0)
    }

    pub fn paused_ms_at(&self, now: DateTime<Utc>) -> i64 {
        let current = self
            .state
            .pause_start
            .map(|p| (now - p).num_milliseconds().max(0))
            .unwrap_or(0);
        self.state.accumulated_paused_ms + current
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds_at(Utc::now())
    }

    pub fn elapsed_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        (self.elapsed_ms_at(now) / 1000) as u64
    }

    pub fn paused_seconds(&self) -> u64 {
        self.paused_seconds_at(Utc::now())
    }

    pub fn paused_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        (self.paused_ms_at(now).max(0) / 1000) as u64
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        Duration::milliseconds(self.elapsed_ms_at(now))
    }
}

/// Format seconds as `H:MM:SS`, or `M:SS` under an hour
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}
