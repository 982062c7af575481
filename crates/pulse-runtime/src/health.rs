//! Liveness report shared between the tick loop and the HTTP surface.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pulse_core::{CircuitStatus, Result, RuntimeState, TickId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Everything an operator needs to tell whether the loop is alive and well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub state: RuntimeState,
    pub started_at: DateTime<Utc>,
    pub tick_count: u64,
    pub last_tick_id: Option<TickId>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub next_tick_in_secs: u64,
    pub breaker: CircuitStatus,
    pub error_streak: u32,
    pub runaway_score: f64,
    pub runaway_active: bool,
    pub throttled: bool,
    pub paused: bool,
    pub safe_mode: bool,
    pub budget_used: u32,
    pub budget_limit: u32,
    pub persist_pending: bool,
    pub learning_events_dropped: u64,
}

impl HealthReport {
    pub fn starting(state: RuntimeState, now: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Ok,
            state,
            started_at: now,
            tick_count: 0,
            last_tick_id: None,
            last_tick_at: None,
            last_success_at: None,
            last_outcome: None,
            next_tick_in_secs: 0,
            breaker: CircuitStatus::Closed,
            error_streak: 0,
            runaway_score: 0.0,
            runaway_active: false,
            throttled: false,
            paused: false,
            safe_mode: false,
            budget_used: 0,
            budget_limit: 0,
            persist_pending: false,
            learning_events_dropped: 0,
        }
    }

    /// Recompute `status` from the other fields.
    pub fn refresh_status(&mut self) {
        let degraded = self.breaker != CircuitStatus::Closed
            || self.error_streak > 0
            || self.runaway_active
            || self.persist_pending;
        self.status = if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
    }
}

/// Cloneable handle to the latest report.
#[derive(Clone)]
pub struct HealthHandle {
    inner: Arc<RwLock<HealthReport>>,
}

impl HealthHandle {
    pub fn new(report: HealthReport) -> Self {
        Self {
            inner: Arc::new(RwLock::new(report)),
        }
    }

    pub fn snapshot(&self) -> HealthReport {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut HealthReport)) {
        let mut report = self.inner.write();
        f(&mut report);
        report.refresh_status();
    }
}

/// Write the report as JSON, replacing the file atomically.
pub fn write_health_file(path: &Path, report: &HealthReport) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
