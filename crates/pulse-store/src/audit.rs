use chrono::Utc;
use parking_lot::Mutex;
use pulse_core::{Checkpoint, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

use crate::store::storage_err;

/// Append-only copy of committed checkpoints in a separate SQLite file.
///
/// Lives apart from the shared store so that losing or corrupting one file
/// leaves a trail in the other.
pub struct AuditMirror {
    db: Mutex<Connection>,
}

impl AuditMirror {
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening checkpoint audit mirror");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS checkpoint_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tick_id TEXT NOT NULL,
                state TEXT NOT NULL,
                working_set TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                mirrored_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoint_audit_tick ON checkpoint_audit(tick_id);
            ",
        )
        .map_err(storage_err)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn record(&self, checkpoint: &Checkpoint) -> Result<()> {
        let working_set = serde_json::to_string(&checkpoint.working_set)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO checkpoint_audit (tick_id, state, working_set, committed_at, mirrored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                checkpoint.tick_id.to_string(),
                checkpoint.state.as_str(),
                working_set,
                checkpoint.committed_at.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let db = self.db.lock();
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM checkpoint_audit", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n.max(0) as u64)
    }
}
