use chrono::{DateTime, Utc};
use pulse_core::{QuotaLedger, Result, WindowUsage};
use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::store::{Store, storage_err};

impl QuotaLedger for Store {
    fn append(
        &self,
        quota: &str,
        call_id: &str,
        consumer: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut db = self.db.lock();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO budget_events (quota, call_id, consumer, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![quota, call_id, consumer, at.timestamp_millis()],
            )
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(inserted == 1)
    }

    fn usage(
        &self,
        quota: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage> {
        let mut db = self.db.lock();
        // IMMEDIATE takes the write lock up front so prune + count is one atomic step.
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM budget_events WHERE quota = ?1 AND ts_ms <= ?2",
            rusqlite::params![quota, window_start.timestamp_millis()],
        )
        .map_err(storage_err)?;
        let (count, oldest): (i64, Option<i64>) = tx
            .query_row(
                "SELECT COUNT(*), MIN(ts_ms) FROM budget_events WHERE quota = ?1 AND ts_ms <= ?2",
                rusqlite::params![quota, now.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?
            .unwrap_or((0, None));
        tx.commit().map_err(storage_err)?;

        Ok(WindowUsage {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest: oldest.and_then(DateTime::from_timestamp_millis),
        })
    }
}
