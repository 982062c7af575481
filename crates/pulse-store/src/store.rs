use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulse_core::{
    Checkpoint, CircuitBreakerState, ExternalEvent, Overrides, PulseError, Result, RuntimeState,
    RuntimeStore, WorkingSet,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditMirror;

pub(crate) fn storage_err(e: rusqlite::Error) -> PulseError {
    PulseError::Storage(e.to_string())
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| PulseError::Storage(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PulseError::Storage(format!("bad id '{raw}': {e}")))
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS budget_events (
        quota TEXT NOT NULL,
        call_id TEXT NOT NULL,
        consumer TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        PRIMARY KEY (quota, call_id)
    );
    CREATE INDEX IF NOT EXISTS idx_budget_events_ts ON budget_events(quota, ts_ms);

    CREATE TABLE IF NOT EXISTS overrides (
        name TEXT PRIMARY KEY,
        enabled INTEGER NOT NULL,
        set_by TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS breaker_state (
        capability TEXT PRIMARY KEY,
        state_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runtime_checkpoint (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        state TEXT NOT NULL,
        working_set TEXT NOT NULL,
        tick_id TEXT NOT NULL,
        committed_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS external_events (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT 'null',
        received_at TEXT NOT NULL,
        acked_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_external_events_pending ON external_events(acked_at, received_at);

    CREATE TABLE IF NOT EXISTS learning_events (
        id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        runaway_type TEXT NOT NULL,
        body TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        processed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_learning_events_processed ON learning_events(processed, timestamp);

    CREATE TRIGGER IF NOT EXISTS learning_events_write_once
    BEFORE UPDATE OF id, timestamp, event_type, runaway_type, body ON learning_events
    BEGIN
        SELECT RAISE(ABORT, 'learning events are write-once');
    END;

    CREATE TRIGGER IF NOT EXISTS learning_events_no_delete
    BEFORE DELETE ON learning_events
    BEGIN
        SELECT RAISE(ABORT, 'learning events are append-only');
    END;
";

/// The SQLite file shared by every process that draws on the same quota.
///
/// Each public operation runs in its own transaction, so sibling processes
/// opening the same file see consistent budget counts and overrides.
pub struct Store {
    pub(crate) db: Arc<Mutex<Connection>>,
    audit: Option<AuditMirror>,
    path: PathBuf,
}

impl Store {
    /// Open or create the store at the given path with a 5 s busy timeout.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(5000))
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!(?path, "opening shared store");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && path != Path::new(":memory:")
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(storage_err)?;
        conn.busy_timeout(busy_timeout).map_err(storage_err)?;

        // WAL lets a reader (status, health) run while the loop writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            audit: None,
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Mirror every committed checkpoint into `mirror`.
    pub fn with_audit_mirror(mut self, mirror: AuditMirror) -> Self {
        self.audit = Some(mirror);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event for the runtime to surface on its next tick.
    pub fn enqueue_external_event(
        &self,
        source: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let db = self.db.lock();
        db.execute(
            "INSERT INTO external_events (id, source, kind, payload, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id.to_string(),
                source,
                kind,
                payload.to_string(),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(id)
    }
}

impl RuntimeStore for Store {
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT state, working_set, tick_id, committed_at FROM runtime_checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;

        let Some((state, working_set, tick_id, committed_at)) = row else {
            return Ok(None);
        };
        let state: RuntimeState = state.parse().map_err(PulseError::Storage)?;
        let working_set: WorkingSet = serde_json::from_str(&working_set)?;
        Ok(Some(Checkpoint {
            state,
            working_set,
            tick_id: parse_uuid(&tick_id)?,
            committed_at: parse_ts(&committed_at)?,
        }))
    }

    fn commit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let working_set = serde_json::to_string(&checkpoint.working_set)?;
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        tx.execute(
            "INSERT INTO runtime_checkpoint (id, state, working_set, tick_id, committed_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                working_set = excluded.working_set,
                tick_id = excluded.tick_id,
                committed_at = excluded.committed_at",
            rusqlite::params![
                checkpoint.state.as_str(),
                working_set,
                checkpoint.tick_id.to_string(),
                checkpoint.committed_at.to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        debug!(tick_id = %checkpoint.tick_id, state = %checkpoint.state, "checkpoint committed");
        Ok(())
    }

    fn load_breaker(&self, capability: &str) -> Result<Option<CircuitBreakerState>> {
        let db = self.db.lock();
        let raw: Option<String> = db
            .query_row(
                "SELECT state_json FROM breaker_state WHERE capability = ?1",
                [capability],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO breaker_state (capability, state_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(capability) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
            rusqlite::params![state.capability, json, Utc::now().to_rfc3339()],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn overrides(&self) -> Result<Overrides> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT name, enabled FROM overrides")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;

        let mut overrides = Overrides::default();
        for row in rows {
            let (name, enabled) = row.map_err(storage_err)?;
            let enabled = enabled != 0;
            match name.as_str() {
                Overrides::PAUSED => overrides.paused = enabled,
                Overrides::SAFE_MODE => overrides.safe_mode = enabled,
                other => debug!(name = other, "ignoring unknown override"),
            }
        }
        Ok(overrides)
    }

    fn set_override(&self, name: &str, enabled: bool, set_by: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO overrides (name, enabled, set_by, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled, set_by = excluded.set_by, updated_at = excluded.updated_at",
            rusqlite::params![name, enabled as i64, set_by, Utc::now().to_rfc3339()],
        )
        .map_err(storage_err)?;
        info!(name, enabled, set_by, "override updated");
        Ok(())
    }

    fn pending_external_events(&self, limit: usize) -> Result<Vec<ExternalEvent>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id, source, kind, payload, received_at FROM external_events
                 WHERE acked_at IS NULL ORDER BY received_at ASC LIMIT ?1",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(storage_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (id, source, kind, payload, received_at) = row.map_err(storage_err)?;
            events.push(ExternalEvent {
                id: parse_uuid(&id)?,
                source,
                kind,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                received_at: parse_ts(&received_at)?,
            });
        }
        Ok(events)
    }

    fn ack_external_events(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(storage_err)?;
        for id in ids {
            tx.execute(
                "UPDATE external_events SET acked_at = ?1 WHERE id = ?2 AND acked_at IS NULL",
                rusqlite::params![now, id.to_string()],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    fn mirror_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        match &self.audit {
            Some(mirror) => mirror.record(checkpoint),
            None => Ok(()),
        }
    }
}
