use chrono::Utc;
use pulse_core::{LearningEvent, LearningSink, Result};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::store::{Store, parse_ts, storage_err};

impl LearningSink for Store {
    /// Append once. Re-appending an id that already exists is a no-op, so a
    /// retried write cannot duplicate or alter an event.
    fn append_learning_event(&self, event: &LearningEvent) -> Result<()> {
        let body = serde_json::to_string(event)?;
        let db = self.db.lock();
        db.execute(
            "INSERT OR IGNORE INTO learning_events (id, timestamp, event_type, runaway_type, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event.id.to_string(),
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.runaway_type.as_str(),
                body
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

type LearningRow = (String, i64, Option<String>);

// ── Consumer side ──────────────────────────────────────────────

impl Store {
    /// Oldest unprocessed events first.
    pub fn unprocessed_learning_events(&self, limit: usize) -> Result<Vec<LearningEvent>> {
        self.query_learning(
            "SELECT body, processed, processed_at FROM learning_events
             WHERE processed = 0 ORDER BY timestamp ASC LIMIT ?1",
            limit,
        )
    }

    /// Most recent events, processed or not.
    pub fn recent_learning_events(&self, limit: usize) -> Result<Vec<LearningEvent>> {
        self.query_learning(
            "SELECT body, processed, processed_at FROM learning_events
             ORDER BY timestamp DESC LIMIT ?1",
            limit,
        )
    }

    pub fn load_learning_event(&self, id: Uuid) -> Result<Option<LearningEvent>> {
        let db = self.db.lock();
        let row: Option<LearningRow> = db
            .query_row(
                "SELECT body, processed, processed_at FROM learning_events WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage_err)?;
        row.map(decode_learning_row).transpose()
    }

    /// Flag an event as consumed. Returns `false` if it was unknown or already processed.
    pub fn mark_learning_event_processed(&self, id: Uuid) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "UPDATE learning_events SET processed = 1, processed_at = ?1
                 WHERE id = ?2 AND processed = 0",
                rusqlite::params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(storage_err)?;
        Ok(rows > 0)
    }

    pub fn learning_event_count(&self) -> Result<u64> {
        let db = self.db.lock();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM learning_events", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count.max(0) as u64)
    }

    pub fn unprocessed_learning_event_count(&self) -> Result<u64> {
        let db = self.db.lock();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM learning_events WHERE processed = 0",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count.max(0) as u64)
    }

    fn query_learning(&self, sql: &str, limit: usize) -> Result<Vec<LearningEvent>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(storage_err)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(decode_learning_row(row.map_err(storage_err)?)?);
        }
        Ok(events)
    }
}

fn decode_learning_row((body, processed, processed_at): LearningRow) -> Result<LearningEvent> {
    let mut event: LearningEvent = serde_json::from_str(&body)?;
    event.processed = processed != 0;
    event.processed_at = processed_at.as_deref().map(parse_ts).transpose()?;
    Ok(event)
}
