//! Read-side helpers shared by `status`, `learning` and the override commands.

use chrono::{DateTime, Utc};
use pulse_autonomy::{BudgetTracker, REASONING_ENGINE};
use pulse_config::PulseConfig;
use pulse_core::{
    BudgetSnapshot, CircuitBreakerState, LearningEvent, Overrides, QuotaLedger, Result,
    RuntimeState, RuntimeStore, TickId,
};
use pulse_store::{AuditMirror, Store};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Open the shared store named by `[storage]`, attaching the audit mirror if configured.
pub fn open_store(config: &PulseConfig) -> Result<Arc<Store>> {
    let storage = &config.storage;
    let mut store = Store::open_with_timeout(
        &storage.resolved_db_path(),
        Duration::from_millis(storage.busy_timeout_ms),
    )?;
    if let Some(path) = &storage.audit_path {
        store = store.with_audit_mirror(AuditMirror::open(path)?);
    }
    Ok(Arc::new(store))
}

/// What `pulse status` prints.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: RuntimeState,
    pub last_tick_id: Option<TickId>,
    pub last_committed_at: Option<DateTime<Utc>>,
    pub tick_count: u64,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub parked_tasks: usize,
    pub overrides: Overrides,
    pub budget: BudgetSnapshot,
    pub breaker: Option<CircuitBreakerState>,
    pub learning_events: u64,
    pub unprocessed_learning_events: u64,
}

/// Gather a status report without touching anything the loop owns.
pub fn collect_status(config: &PulseConfig, store: Arc<Store>) -> Result<StatusReport> {
    let now = Utc::now();
    let checkpoint = store.load_checkpoint()?;
    let overrides = store.overrides()?;
    let breaker = store.load_breaker(REASONING_ENGINE)?;
    let learning_events = store.learning_event_count()?;
    let unprocessed = store.unprocessed_learning_event_count()?;

    let ledger: Arc<dyn QuotaLedger> = store;
    let budget = BudgetTracker::new(ledger, &config.budget).snapshot_at(now)?;

    let (state, last_tick_id, last_committed_at, ws) = match checkpoint {
        Some(cp) => (cp.state, Some(cp.tick_id), Some(cp.committed_at), cp.working_set),
        None => (config.states.initial, None, None, Default::default()),
    };

    Ok(StatusReport {
        state,
        last_tick_id,
        last_committed_at,
        tick_count: ws.tick_count,
        active_tasks: ws.active.len(),
        pending_tasks: ws.pending.len(),
        parked_tasks: ws.parked.len(),
        overrides,
        budget,
        breaker,
        learning_events,
        unprocessed_learning_events: unprocessed,
    })
}

impl StatusReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "State:       {}", self.state);
        match (self.last_tick_id, self.last_committed_at) {
            (Some(id), Some(at)) => {
                let _ = writeln!(out, "Last tick:   {id} at {}", at.to_rfc3339());
            }
            _ => {
                let _ = writeln!(out, "Last tick:   none (no checkpoint yet)");
            }
        }
        let _ = writeln!(out, "Ticks:       {}", self.tick_count);
        let _ = writeln!(
            out,
            "Tasks:       {} active, {} pending, {} parked",
            self.active_tasks, self.pending_tasks, self.parked_tasks
        );
        let _ = writeln!(
            out,
            "Overrides:   paused={} safe_mode={}",
            self.overrides.paused, self.overrides.safe_mode
        );
        let b = &self.budget;
        let _ = writeln!(
            out,
            "Budget:      {}/{} in {}s window ({} reserved){}",
            b.used_in_window,
            b.limit,
            b.window_duration,
            b.reserved_for_other_consumer,
            if b.withheld() {
                ", withheld"
            } else if b.throttle_active {
                ", throttled"
            } else {
                ""
            }
        );
        match &self.breaker {
            Some(cb) => {
                let _ = writeln!(
                    out,
                    "Breaker:     {} ({} consecutive failures)",
                    cb.status, cb.consecutive_failures
                );
            }
            None => {
                let _ = writeln!(out, "Breaker:     closed (never tripped)");
            }
        }
        let _ = writeln!(
            out,
            "Learning:    {} events, {} unprocessed",
            self.learning_events, self.unprocessed_learning_events
        );
        out
    }
}

/// One-line summary of a learning event.
pub fn learning_line(event: &LearningEvent) -> String {
    format!(
        "{} {} {:<15} score={:.2} ticks={} {}",
        event.id,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.runaway_type.to_string(),
        event.score.total,
        event.tick_count,
        if event.processed { "processed" } else { "open" }
    )
}
