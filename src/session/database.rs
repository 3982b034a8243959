// SQLite store for recording sessions
//
// Two tables: `active_sessions` holds every session the registry is tracking
// so a restarted daemon can pick them back up, and `recordings` keeps a
// history of finished runs. Session rows are stored as JSON with RFC 3339
// timestamps so they survive a round trip unchanged.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recording::RecordingSession;

/// Session store
///
/// Wraps Connection in a parking_lot::Mutex since rusqlite::Connection is not Sync.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

/// One finished recording run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub run_id: Uuid,
    pub camera_id: String,
    pub camera_name: String,
    pub scenario_id: Option<String>,
    pub scenario_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub paused_secs: u64,
    pub segments: Vec<String>,
}

impl SessionStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (fallback when the file store fails, and tests)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS active_sessions (
                camera_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recordings (
                run_id TEXT PRIMARY KEY,
                camera_id TEXT NOT NULL,
                camera_name TEXT NOT NULL,
                scenario_id TEXT,
                scenario_name TEXT,
                started_at TEXT NOT NULL,
                stopped_at TEXT NOT NULL,
                elapsed_secs INTEGER NOT NULL,
                paused_secs INTEGER NOT NULL,
                segments TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_recordings_stopped ON recordings(stopped_at DESC);
            CREATE INDEX IF NOT EXISTS idx_recordings_camera ON recordings(camera_id);
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace the persisted copy of a session
    pub fn upsert(&self, session: &RecordingSession) -> anyhow::Result<()> {
        let payload = serde_json::to_string(session)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO active_sessions (camera_id, state, payload, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(camera_id) DO UPDATE SET
                state = excluded.state,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
            params![
                session.camera_id,
                session.state.as_str(),
                payload,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Forget a session. Only called after a confirmed stop.
    pub fn remove(&self, camera_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM active_sessions WHERE camera_id = ?1",
            params![camera_id],
        )?;
        Ok(removed > 0)
    }

    pub fn get(&self, camera_id: &str) -> anyhow::Result<Option<RecordingSession>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM active_sessions WHERE camera_id = ?1",
                params![camera_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// Load every persisted session. Rows that no longer parse are skipped
    /// with a warning rather than failing the whole load.
    pub fn load_all(&self) -> anyhow::Result<Vec<RecordingSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT camera_id, payload FROM active_sessions ORDER BY camera_id")?;

        let mut sessions = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let camera_id: String = row.get(0)?;
            let payload: String = row.get(1)?;
            match serde_json::from_str::<RecordingSession>(&payload) {
                Ok(session) => sessions.push(session),
                Err(e) => log::warn!("[Store] Skipping unreadable session {}: {}", camera_id, e),
            }
        }
        Ok(sessions)
    }

    /// Append a finished run to the history
    pub fn record_completed(&self, summary: &RecordingSummary) -> anyhow::Result<()> {
        let segments = serde_json::to_string(&summary.segments)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO recordings (
                run_id, camera_id, camera_name, scenario_id, scenario_name,
                started_at, stopped_at, elapsed_secs, paused_secs, segments
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                summary.run_id.to_string(),
                summary.camera_id,
                summary.camera_name,
                summary.scenario_id,
                summary.scenario_name,
                summary.started_at.to_rfc3339(),
                summary.stopped_at.to_rfc3339(),
                summary.elapsed_secs as i64,
                summary.paused_secs as i64,
                segments,
            ],
        )?;
        Ok(())
    }

    /// Most recent finished runs, newest first, optionally for one camera
    pub fn recent_recordings(
        &self,
        camera_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<RecordingSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, camera_id, camera_name, scenario_id, scenario_name,
                   started_at, stopped_at, elapsed_secs, paused_secs, segments
            FROM recordings
            WHERE (?1 IS NULL OR camera_id = ?1)
            ORDER BY stopped_at DESC
            LIMIT ?2
            "#,
        )?;

        let mut out = Vec::new();
        let mut rows = stmt.query(params![camera_id, limit as i64])?;
        while let Some(row) = rows.next()? {
            let run_id: String = row.get(0)?;
            let started_at: String = row.get(5)?;
            let stopped_at: String = row.get(6)?;
            let segments: String = row.get(9)?;

            out.push(RecordingSummary {
                run_id: Uuid::parse_str(&run_id)?,
                camera_id: row.get(1)?,
                camera_name: row.get(2)?,
                scenario_id: row.get(3)?,
                scenario_name: row.get(4)?,
                started_at: parse_timestamp(&started_at)?,
                stopped_at: parse_timestamp(&stopped_at)?,
                elapsed_secs: row.get::<_, i64>(7)? as u64,
                paused_secs: row.get::<_, i64>(8)? as u64,
                segments: serde_json::from_str(&segments).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
