//! Durable run ledger: run status, per-provider resource records and the
//! append-only event log.
//!
//! This is the source of truth for recovery and for out-of-band commands
//! (`vriksh logs`, `vriksh teardown`) that have no live run context. The
//! orchestrator never deletes ledger rows; terminal status retires a run
//! logically, physical cleanup is an external housekeeping concern.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run already exists in ledger: {0}")]
    DuplicateRun(String),
    #[error("no runs recorded yet")]
    Empty,
    #[error("run not found in ledger: {0}")]
    RunNotFound(String),
    #[error("ledger home directory could not be resolved")]
    NoHome,
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub lab_id: String,
    pub status: String,
    pub backend: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub run_id: String,
    pub provider_id: String,
    pub provider_type: String,
    pub resource_id: String,
    pub metadata: Value,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub seq: i64,
    pub run_id: String,
    pub event_type: String,
    pub message: String,
    pub payload: Option<Value>,
    pub timestamp: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  lab_id TEXT NOT NULL,
  status TEXT NOT NULL,
  backend TEXT NOT NULL DEFAULT 'docker',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS providers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  provider_id TEXT NOT NULL,
  type TEXT NOT NULL,
  resource_id TEXT NOT NULL,
  metadata TEXT NOT NULL,
  status TEXT NOT NULL,
  UNIQUE(run_id, provider_id),
  FOREIGN KEY(run_id) REFERENCES runs(id)
);
CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  type TEXT NOT NULL,
  message TEXT NOT NULL,
  payload TEXT,
  timestamp TEXT NOT NULL,
  FOREIGN KEY(run_id) REFERENCES runs(id)
);
";

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Opens (creating if needed) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// `$VRIKSH_HOME/state.sqlite`, defaulting to `~/.vriksh/state.sqlite`.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let home = match std::env::var_os("VRIKSH_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir().ok_or(StoreError::NoHome)?.join(".vriksh"),
        };
        Ok(home.join("state.sqlite"))
    }

    pub fn create_run(&self, run_id: &str, lab_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let result = self.conn.execute(
            "INSERT INTO runs (id, lab_id, status, backend, created_at, updated_at)
             VALUES (?1, ?2, 'preparing', 'docker', ?3, ?3)",
            params![run_id, lab_id, now],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::DuplicateRun(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent in-place overwrite of the run status.
    pub fn update_status(&self, run_id: &str, status: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        tracing::debug!(run_id, status, "ledger status updated");
        Ok(())
    }

    pub fn add_provider_record(
        &self,
        run_id: &str,
        provider_id: &str,
        provider_type: &str,
        resource_id: &str,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO providers (run_id, provider_id, type, resource_id, metadata, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'provisioned')",
            params![
                run_id,
                provider_id,
                provider_type,
                resource_id,
                serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn list_providers(&self, run_id: &str) -> Result<Vec<ProviderRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, provider_id, type, resource_id, metadata, status
             FROM providers WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let raw: String = row.get(4)?;
            Ok(ProviderRecord {
                run_id: row.get(0)?,
                provider_id: row.get(1)?,
                provider_type: row.get(2)?,
                resource_id: row.get(3)?,
                metadata: serde_json::from_str(&raw).unwrap_or(Value::Null),
                status: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Appends to the event log. Errors here must reach the caller: the
    /// event log is the only audit trail a run leaves behind.
    pub fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        message: &str,
        payload: Option<&Value>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO events (run_id, type, message, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                event_type,
                message,
                payload.map(|p| p.to_string()),
                now
            ],
        )?;
        Ok(())
    }

    /// Events in insertion order.
    pub fn list_events(&self, run_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, type, message, payload, timestamp
             FROM events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let payload: Option<String> = row.get(4)?;
            Ok(EventRecord {
                seq: row.get(0)?,
                run_id: row.get(1)?,
                event_type: row.get(2)?,
                message: row.get(3)?,
                payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                timestamp: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, lab_id, status, backend, created_at, updated_at
             FROM runs WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![run_id], map_run_row)
            .optional()?)
    }

    pub fn get_most_recent_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, lab_id, status, backend, created_at, updated_at
             FROM runs ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )?;
        Ok(stmt.query_row([], map_run_row).optional()?)
    }
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        lab_id: row.get(1)?,
        status: row.get(2)?,
        backend: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> Ledger {
        Ledger::open_in_memory().expect("in-memory ledger")
    }

    #[test]
    fn create_run_rejects_duplicate_ids() {
        let ledger = ledger();
        ledger.create_run("run_1", "lab-a").expect("first insert");
        let err = ledger.create_run("run_1", "lab-a").expect_err("duplicate");
        assert!(
            matches!(err, StoreError::DuplicateRun(_)),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn update_status_overwrites_in_place() {
        let ledger = ledger();
        ledger.create_run("run_1", "lab-a").expect("insert");
        ledger.update_status("run_1", "provisioning").expect("update");
        ledger.update_status("run_1", "completed").expect("update");
        let run = ledger.get_run("run_1").expect("get").expect("exists");
        assert_eq!(run.status, "completed");
    }

    #[test]
    fn update_status_of_unknown_run_fails() {
        let ledger = ledger();
        let err = ledger.update_status("ghost", "failed").expect_err("missing run");
        assert!(matches!(err, StoreError::RunNotFound(_)), "got: {}", err);
    }

    #[test]
    fn events_come_back_in_insertion_order() {
        let ledger = ledger();
        ledger.create_run("run_1", "lab-a").expect("insert");
        for (t, m) in [("PREPARE", "a"), ("PROVISION", "b"), ("READY", "c")] {
            ledger.append_event("run_1", t, m, None).expect("append");
        }
        let events = ledger.list_events("run_1").expect("list");
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["PREPARE", "PROVISION", "READY"]);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn event_payload_round_trips() {
        let ledger = ledger();
        ledger.create_run("run_1", "lab-a").expect("insert");
        ledger
            .append_event("run_1", "SCORE", "final", Some(&json!({"score": 10})))
            .expect("append");
        let events = ledger.list_events("run_1").expect("list");
        assert_eq!(events[0].payload, Some(json!({"score": 10})));
    }

    #[test]
    fn provider_records_list_per_run() {
        let ledger = ledger();
        ledger.create_run("run_1", "lab-a").expect("insert");
        ledger.create_run("run_2", "lab-a").expect("insert");
        ledger
            .add_provider_record("run_1", "gitlab-main", "gitlab", "cid-1", &json!({"url": "u"}))
            .expect("add");
        ledger
            .add_provider_record("run_2", "gitlab-main", "gitlab", "cid-2", &json!({}))
            .expect("add");
        let records = ledger.list_providers("run_1").expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_id, "cid-1");
        assert_eq!(records[0].status, "provisioned");
        assert_eq!(records[0].metadata, json!({"url": "u"}));
    }

    #[test]
    fn most_recent_run_prefers_latest_insert() {
        let ledger = ledger();
        ledger.create_run("run_old", "lab-a").expect("insert");
        ledger.create_run("run_new", "lab-b").expect("insert");
        let run = ledger.get_most_recent_run().expect("query").expect("some");
        assert_eq!(run.id, "run_new");
    }

    #[test]
    fn most_recent_run_on_empty_ledger_is_none() {
        let ledger = ledger();
        assert!(ledger.get_most_recent_run().expect("query").is_none());
    }
}
