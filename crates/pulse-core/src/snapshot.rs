use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::state::RuntimeState;
use crate::working_set::WorkingSet;
use crate::TickId;

/// Point-in-time view of a rolling-window quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub limit: u32,
    /// Window length in seconds.
    pub window_duration: u64,
    pub used_in_window: u32,
    pub remaining: u32,
    pub throttle_active: bool,
    pub reserved_for_other_consumer: u32,
    pub oldest_entry_at: Option<DateTime<Utc>>,
    pub taken_at: DateTime<Utc>,
}

impl BudgetSnapshot {
    /// True when this consumer must not spend: what is left belongs to the other consumer.
    pub fn withheld(&self) -> bool {
        self.remaining <= self.reserved_for_other_consumer
    }

    /// How long until the oldest entry falls out of the window.
    pub fn retry_after(&self) -> Duration {
        let Some(oldest) = self.oldest_entry_at else {
            return Duration::ZERO;
        };
        let expires = oldest + chrono::Duration::seconds(self.window_duration as i64);
        (expires - self.taken_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Circuit breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Persistable breaker state for one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub capability: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
    /// Probe calls still admitted while half-open.
    #[serde(default)]
    pub half_open_remaining: u32,
    #[serde(default)]
    pub half_open_successes: u32,
}

impl CircuitBreakerState {
    pub fn closed(capability: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            capability: capability.into(),
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_state_change: now,
            half_open_remaining: 0,
            half_open_successes: 0,
        }
    }
}

/// Operator switches stored in the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    pub paused: bool,
    pub safe_mode: bool,
}

impl Overrides {
    pub const PAUSED: &'static str = "paused";
    pub const SAFE_MODE: &'static str = "safe_mode";
}

/// Coarse health of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Down,
}

/// Something another process asked the runtime to notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: Uuid,
    pub source: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Everything the reasoning engine sees for one tick. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub tick_id: TickId,
    pub timestamp: DateTime<Utc>,
    pub since_last_tick_secs: Option<u64>,
    pub current_state: RuntimeState,
    pub error_streak: u32,
    pub breaker: CircuitStatus,
    pub budget: BudgetSnapshot,
    pub external_events: Vec<ExternalEvent>,
    pub service_health: BTreeMap<String, ServiceHealth>,
    pub working_set: WorkingSet,
    pub overrides: Overrides,
    /// Advisory flags for the engine, e.g. `"replan"`.
    #[serde(default)]
    pub hints: Vec<String>,
}
