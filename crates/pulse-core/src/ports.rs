//! Storage seams between the runtime logic and the shared store.
//!
//! The SQLite implementation lives in `pulse-store`; tests use in-memory fakes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::learning::LearningEvent;
use crate::snapshot::{CircuitBreakerState, ExternalEvent, Overrides};
use crate::state::RuntimeState;
use crate::working_set::WorkingSet;
use crate::{Result, TickId};

/// Count of consumption events inside a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub count: u32,
    pub oldest: Option<DateTime<Utc>>,
}

/// Append-only, cross-process consumption ledger keyed by `(quota, call_id)`.
pub trait QuotaLedger: Send + Sync {
    /// Register one consumption event. Returns `false` when `call_id` was
    /// already recorded for this quota.
    fn append(&self, quota: &str, call_id: &str, consumer: &str, at: DateTime<Utc>)
    -> Result<bool>;

    /// Drop entries at or before `window_start` and count what is left up to `now`,
    /// as one atomic step.
    fn usage(&self, quota: &str, window_start: DateTime<Utc>, now: DateTime<Utc>)
    -> Result<WindowUsage>;
}

/// Durable, append-only sink for learning events.
pub trait LearningSink: Send + Sync {
    fn append_learning_event(&self, event: &LearningEvent) -> Result<()>;
}

/// The unit persisted at the end of every successful tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: RuntimeState,
    pub working_set: WorkingSet,
    pub tick_id: TickId,
    pub committed_at: DateTime<Utc>,
}

/// Everything else the tick loop reads from or writes to the shared store.
pub trait RuntimeStore: Send + Sync {
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>>;

    /// Replace the stored checkpoint in a single transaction.
    fn commit_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    fn load_breaker(&self, capability: &str) -> Result<Option<CircuitBreakerState>>;

    fn save_breaker(&self, state: &CircuitBreakerState) -> Result<()>;

    fn overrides(&self) -> Result<Overrides>;

    fn set_override(&self, name: &str, enabled: bool, set_by: &str) -> Result<()>;

    fn pending_external_events(&self, limit: usize) -> Result<Vec<ExternalEvent>>;

    fn ack_external_events(&self, ids: &[Uuid]) -> Result<()>;

    /// Copy a checkpoint somewhere secondary. Best effort.
    fn mirror_checkpoint(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }
}
