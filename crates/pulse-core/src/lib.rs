//! # pulse-core
//!
//! Core types, traits, and primitives for the Pulse continuous-existence runtime.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! lifecycle states and transition requests, the working set, budget and environment
//! snapshots, runaway scores and learning events, plus the storage ports the runtime
//! talks to.

pub mod error;
pub mod event;
pub mod learning;
pub mod ports;
pub mod snapshot;
pub mod state;
pub mod working_set;

pub use error::{PulseError, Result};
pub use event::{Event, EventBus};
pub use learning::{LearningEvent, RunawayComponents, RunawayScore, RunawayType};
pub use ports::{Checkpoint, LearningSink, QuotaLedger, RuntimeStore, WindowUsage};
pub use snapshot::{
    BudgetSnapshot, CircuitBreakerState, CircuitStatus, EnvironmentSnapshot, ExternalEvent,
    Overrides, ServiceHealth,
};
pub use state::{
    ReportedMarker, RuntimeState, StateTransitionRequest, TaskUpdate, TransitionType,
};
pub use working_set::{ProgressMarker, TaskEntry, TaskRejection, TaskState, WorkingSet};

/// Unique identifier for a tick.
pub type TickId = uuid::Uuid;

/// Unique identifier for a task entry.
pub type TaskId = uuid::Uuid;
