use chrono::{DateTime, Duration, SecondsFormat, Utc};
use deskpilot_core::{AutonomyRun, DesktopEvent};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How much history `prune` keeps. Zero disables a limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_runs: usize,
    pub max_events: usize,
    pub max_age_days: u32,
    /// Period of the background prune; zero leaves pruning to the CLI.
    pub prune_interval_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_runs: 1_000,
            max_events: 50_000,
            max_age_days: 30,
            prune_interval_secs: 3_600,
        }
    }
}

impl RetentionPolicy {
    pub fn prune_interval(&self) -> Option<std::time::Duration> {
        (self.prune_interval_secs > 0).then(|| std::time::Duration::from_secs(self.prune_interval_secs))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub runs_removed: usize,
    pub events_removed: usize,
}

const TERMINAL: &str = "('completed', 'failed', 'cancelled')";

// fixed-width UTC stamps so text comparison orders by time
fn stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    retention: RetentionPolicy,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P, retention: RetentionPolicy) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, retention)
    }

    pub fn in_memory(retention: RetentionPolicy) -> Result<Self, SqliteStoreError> {
        Self::init(Connection::open_in_memory()?, retention)
    }

    fn init(conn: Connection, retention: RetentionPolicy) -> Result<Self, SqliteStoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                objective TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                payload_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_updated ON runs(updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                window_title TEXT NOT NULL,
                process_path TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Insert or replace the stored copy of a run.
    pub fn save_run(&self, run: &AutonomyRun) -> Result<(), SqliteStoreError> {
        let payload = serde_json::to_string(run)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (run_id, status, objective, started_at, updated_at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                payload_json = excluded.payload_json",
            params![
                run.run_id,
                run.status.as_str(),
                run.objective,
                stamp(&run.started_at),
                stamp(&run.updated_at),
                payload
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<AutonomyRun>, SqliteStoreError> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<AutonomyRun>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload_json FROM runs ORDER BY updated_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(serde_json::from_str(&row?)?);
        }
        Ok(runs)
    }

    pub fn append_event(&self, event: &DesktopEvent) -> Result<i64, SqliteStoreError> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (kind, window_title, process_path, timestamp, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.kind.as_str(),
                event.window_title,
                event.process_path,
                stamp(&event.timestamp),
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<DesktopEvent>, SqliteStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload_json FROM events ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }

    pub fn run_count(&self) -> Result<usize, SqliteStoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn event_count(&self) -> Result<usize, SqliteStoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Apply the retention policy. Runs that have not finished are never
    /// removed.
    pub fn prune(&self) -> Result<PruneReport, SqliteStoreError> {
        let mut report = PruneReport::default();
        let conn = self.conn.lock();

        if self.retention.max_age_days > 0 {
            let cutoff = stamp(&(Utc::now() - Duration::days(i64::from(self.retention.max_age_days))));
            report.runs_removed += conn.execute(
                &format!("DELETE FROM runs WHERE status IN {} AND updated_at < ?1", TERMINAL),
                params![cutoff],
            )?;
            report.events_removed += conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])?;
        }

        if self.retention.max_runs > 0 {
            report.runs_removed += conn.execute(
                &format!(
                    "DELETE FROM runs WHERE status IN {} AND run_id NOT IN
                        (SELECT run_id FROM runs ORDER BY updated_at DESC LIMIT ?1)",
                    TERMINAL
                ),
                params![self.retention.max_runs as i64],
            )?;
        }

        if self.retention.max_events > 0 {
            report.events_removed += conn.execute(
                "DELETE FROM events WHERE id NOT IN (SELECT id FROM events ORDER BY id DESC LIMIT ?1)",
                params![self.retention.max_events as i64],
            )?;
        }

        if report != PruneReport::default() {
            info!(
                "Pruned {} run(s) and {} event(s)",
                report.runs_removed, report.events_removed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_sort_lexically() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(1500);
        assert!(stamp(&early) < stamp(&late));
        assert!(stamp(&early).ends_with('Z'));
    }

    #[test]
    fn test_missing_run_is_none() {
        let store = SqliteStore::in_memory(RetentionPolicy::default()).unwrap();
        assert!(store.get_run("nope").unwrap().is_none());
        assert!(store.recent_runs(10).unwrap().is_empty());
    }
}
