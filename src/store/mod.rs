//! Durable checkpoint store for session snapshots.
//!
//! Checkpoints are written on state transitions so a restart can pick a
//! session back up; the store is never on the hot path of per-event
//! work. SQLite keeps the deployment self-contained.

use crate::session::SessionInfo;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// What gets checkpointed for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub info: SessionInfo,
    pub high_water_mark: u64,
    /// Final-only transcript text at checkpoint time.
    pub transcript_text: String,
}

/// Storage interface for session checkpoints. Implementations are
/// synchronous; callers move them off the async path with
/// `spawn_blocking`.
pub trait SessionStore: Send + Sync {
    fn put(&self, meeting_id: &str, snapshot: &SessionSnapshot) -> Result<()>;
    fn get(&self, meeting_id: &str) -> Result<Option<SessionSnapshot>>;
    fn delete(&self, meeting_id: &str) -> Result<()>;
    /// All checkpointed snapshots. Used once at startup to resume
    /// sessions that outlived the previous process.
    fn list(&self) -> Result<Vec<SessionSnapshot>>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let conn = Connection::open(path).context("Failed to open checkpoint database")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                meeting_id TEXT PRIMARY KEY,
                snapshot   TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn put(&self, meeting_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO sessions (meeting_id, snapshot, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(meeting_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
            rusqlite::params![meeting_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get(&self, meeting_id: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM sessions WHERE meeting_id = ?1",
                rusqlite::params![meeting_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => {
                // Validate at the boundary: a corrupt row is an error,
                // not a silently-empty session.
                let snapshot = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt snapshot for meeting {meeting_id}"))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, meeting_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM sessions WHERE meeting_id = ?1",
            rusqlite::params![meeting_id],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionSnapshot>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT meeting_id, snapshot FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (meeting_id, json) = row?;
            let snapshot: SessionSnapshot = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt snapshot for meeting {meeting_id}"))?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }
}
