use chrono::{DateTime, Utc};
use pulse_config::BudgetConfig;
use pulse_core::{BudgetSnapshot, QuotaLedger, Result};
use std::sync::Arc;
use tracing::debug;

/// Consumer name written next to every ledger entry this process records.
pub const DEFAULT_CONSUMER: &str = "pulse-runtime";

/// Tracks calls against a rolling-window quota shared with other processes.
///
/// Holds no counters of its own: every snapshot is recomputed from the ledger,
/// so a sibling process spending the same quota is always accounted for.
#[derive(Clone)]
pub struct BudgetTracker {
    ledger: Arc<dyn QuotaLedger>,
    quota: String,
    consumer: String,
    limit: u32,
    window_secs: u64,
    throttle_threshold: f64,
    reserved: u32,
}

impl BudgetTracker {
    pub fn new(ledger: Arc<dyn QuotaLedger>, config: &BudgetConfig) -> Self {
        Self {
            ledger,
            quota: config.quota.clone(),
            consumer: DEFAULT_CONSUMER.to_string(),
            limit: config.limit,
            window_secs: config.window_duration,
            throttle_threshold: config.throttle_threshold,
            reserved: config.reserved_for_other_consumer,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn quota(&self) -> &str {
        &self.quota
    }

    /// Record one call. Returns `false` if `call_id` was already counted.
    pub fn record(&self, call_id: &str) -> Result<bool> {
        self.record_at(call_id, Utc::now())
    }

    pub fn record_at(&self, call_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let inserted = self.ledger.append(&self.quota, call_id, &self.consumer, at)?;
        if !inserted {
            debug!(quota = %self.quota, call_id, "budget call already recorded");
        }
        Ok(inserted)
    }

    pub fn snapshot(&self) -> Result<BudgetSnapshot> {
        self.snapshot_at(Utc::now())
    }

    /// Count calls in `(now - window, now]`.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Result<BudgetSnapshot> {
        let window_start = now - chrono::Duration::seconds(self.window_secs as i64);
        let usage = self.ledger.usage(&self.quota, window_start, now)?;
        let used = usage.count;
        let ratio = if self.limit == 0 {
            1.0
        } else {
            used as f64 / self.limit as f64
        };
        Ok(BudgetSnapshot {
            limit: self.limit,
            window_duration: self.window_secs,
            used_in_window: used,
            remaining: self.limit.saturating_sub(used),
            throttle_active: ratio > self.throttle_threshold,
            reserved_for_other_consumer: self.reserved,
            oldest_entry_at: usage.oldest,
            taken_at: now,
        })
    }
}
