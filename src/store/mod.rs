//! SQLite-backed job queue and scene store.
//!
//! Every worker process opens its own [`Database`] on the same file. Status transitions are
//! conditional UPDATEs, so the file is the only coordination point between workers.

mod jobs;
mod scenes;

pub use jobs::{Claim, Job, JobStatus};
pub use scenes::{NewVoice, Project, Scene, SceneArtifacts, SubtitleStatus, Voice};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const CURRENT_SCHEMA_VERSION: i32 = 2;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute("PRAGMA foreign_keys = ON", ())?;

        Self::init_schema(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (version)
            )",
            (),
        )?;

        let version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if version < CURRENT_SCHEMA_VERSION {
            Self::migrate_schema(conn, version)?;
        }

        Ok(())
    }

    fn migrate_schema(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            conn.execute_batch(
                "BEGIN;
                CREATE TABLE IF NOT EXISTS voices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    reference_audio TEXT,
                    reference_text TEXT NOT NULL DEFAULT '',
                    temperature REAL NOT NULL DEFAULT 0.7,
                    top_p REAL NOT NULL DEFAULT 0.7,
                    repetition_penalty REAL,
                    seed INTEGER NOT NULL DEFAULT 42
                );
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    voice_id INTEGER REFERENCES voices(id) ON DELETE SET NULL
                );
                CREATE TABLE IF NOT EXISTS scenes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    scene_number INTEGER NOT NULL,
                    narration TEXT NOT NULL DEFAULT '',
                    narration_tts TEXT NOT NULL DEFAULT '',
                    audio_path TEXT,
                    audio_duration REAL NOT NULL DEFAULT 0,
                    subtitle_path TEXT,
                    subtitle_status TEXT NOT NULL DEFAULT 'none',
                    subtitle_word_count INTEGER NOT NULL DEFAULT 0,
                    narration_word_count INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (project_id, scene_number)
                );
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    scene_id INTEGER NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    error_message TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    processing_started_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS jobs_status_created ON jobs (status, created_at);
                INSERT INTO schema_version (version, updated) VALUES (1, datetime('now'));
                COMMIT;",
            )?;
        }
        if from_version < 2 {
            conn.execute_batch(
                "BEGIN;
                ALTER TABLE jobs ADD COLUMN claim_token INTEGER;
                INSERT INTO schema_version (version, updated) VALUES (2, datetime('now'));
                COMMIT;",
            )?;
        }
        Ok(())
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    pub fn temp_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    /// Project with one scene; returns (project_id, scene_id).
    pub fn seed_scene(db: &Database, narration: &str) -> (i64, i64) {
        let project = db.add_project("demo", None).unwrap();
        let scene = db.add_scene(project, 1, narration, "").unwrap();
        (project, scene)
    }
}
