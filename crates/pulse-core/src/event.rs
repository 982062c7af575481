use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::learning::RunawayType;
use crate::snapshot::CircuitStatus;
use crate::state::RuntimeState;

/// Events emitted by the tick loop. Consumed by the metrics listener and tests;
/// the loop itself never reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Tick lifecycle ─────────────────────────────────────────
    TickStarted {
        tick_id: Uuid,
    },
    TickCompleted {
        tick_id: Uuid,
        state: RuntimeState,
        next_interval_secs: u64,
    },
    TickGated {
        tick_id: Uuid,
        reason: String,
        wait_secs: u64,
    },
    TickPaused {
        tick_id: Uuid,
    },
    TickFailed {
        tick_id: Uuid,
        error: String,
    },

    // ── Reasoning engine ───────────────────────────────────────
    EngineInvoked {
        tick_id: Uuid,
        latency_ms: u64,
    },
    EngineFailed {
        tick_id: Uuid,
        error: String,
    },
    BreakerChanged {
        capability: String,
        status: CircuitStatus,
    },

    // ── Decisions ──────────────────────────────────────────────
    TransitionApplied {
        tick_id: Uuid,
        from: RuntimeState,
        to: RuntimeState,
    },
    TransitionRejected {
        tick_id: Uuid,
        reason: String,
    },
    TaskRejected {
        tick_id: Uuid,
        reason: String,
    },
    BudgetThrottled {
        used: u32,
        limit: u32,
    },

    // ── Runaway / learning ─────────────────────────────────────
    RunawayDetected {
        tick_id: Uuid,
        runaway_type: RunawayType,
        total: f64,
    },
    LearningEventEmitted {
        event_id: Uuid,
    },
    LearningEventDropped {
        event_id: Uuid,
    },

    // ── Persistence ────────────────────────────────────────────
    PersistFailed {
        tick_id: Uuid,
        error: String,
    },

    // ── System ─────────────────────────────────────────────────
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
