//! SQLite-backed storage for cron jobs and the run log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CronError, Result};
use crate::types::{Job, RunLogEntry};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cron_jobs (
        id TEXT PRIMARY KEY,
        name TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        session_target TEXT NOT NULL,
        wake_mode TEXT NOT NULL,
        schedule TEXT NOT NULL,
        payload TEXT NOT NULL,
        isolation TEXT,
        state TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cron_runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        action TEXT NOT NULL,
        entry TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cron_runs_job ON cron_runs(job_id, seq);
";

const JOB_COLUMNS: &str = "id, name, enabled, created_at, updated_at, session_target, wake_mode, schedule, payload, isolation, state";

/// Raw row before the JSON columns are decoded.
struct JobRow {
    id: String,
    name: Option<String>,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
    session_target: String,
    wake_mode: String,
    schedule: String,
    payload: String,
    isolation: Option<String>,
    state: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get::<_, i64>(2)? != 0,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            session_target: row.get(5)?,
            wake_mode: row.get(6)?,
            schedule: row.get(7)?,
            payload: row.get(8)?,
            isolation: row.get(9)?,
            state: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
            session_target: from_text(&self.session_target)?,
            wake_mode: from_text(&self.wake_mode)?,
            schedule: serde_json::from_str(&self.schedule)?,
            payload: serde_json::from_str(&self.payload)?,
            isolation: self.isolation.as_deref().map(serde_json::from_str).transpose()?,
            state: serde_json::from_str(&self.state)?,
        })
    }
}

/// Encode a unit enum as its bare serde name (`"main"`, not `"\"main\""`).
fn to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(text.to_string()))?)
}

/// Persistent storage for cron jobs and their run history.
pub struct CronStore {
    conn: Mutex<Connection>,
}

impl CronStore {
    /// Open or create a cron store.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Cron store opened: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CronError::LockPoisoned)
    }

    /// List all jobs, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM cron_jobs ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Get a job by ID.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM cron_jobs WHERE id = ?1"),
                rusqlite::params![id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Insert or update a job.
    pub fn upsert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cron_jobs
                (id, name, enabled, created_at, updated_at, session_target, wake_mode, schedule, payload, isolation, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                job.id,
                job.name,
                job.enabled as i64,
                job.created_at,
                job.updated_at,
                to_text(&job.session_target)?,
                to_text(&job.wake_mode)?,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.payload)?,
                job.isolation.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&job.state)?,
            ],
        )?;
        Ok(())
    }

    /// Delete a job. Its run history is kept.
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", rusqlite::params![id])?;
        Ok(count > 0)
    }

    /// Append a run-log entry.
    pub fn append_run(&self, entry: &RunLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cron_runs (job_id, ts, action, entry) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                entry.job_id,
                entry.timestamp,
                entry.action.as_str(),
                serde_json::to_string(entry)?,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` entries, oldest first. `job_id = None` spans all jobs.
    pub fn runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn()?;
        let limit = limit.min(i64::MAX as usize) as i64;
        let raw: Vec<String> = match job_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT entry FROM cron_runs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id, limit], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT entry FROM cron_runs ORDER BY seq DESC LIMIT ?1")?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        raw.iter()
            .rev()
            .map(|s| serde_json::from_str(s).map_err(CronError::from))
            .collect()
    }
}
