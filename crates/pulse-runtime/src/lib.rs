//! # pulse-runtime
//!
//! The continuous-existence loop. Each tick:
//!
//! ```text
//!   overrides ─► budget gate ─► breaker gate ─► snapshot
//!                                                  │
//!                                                  ▼
//!   sleep ◄── interval ◄── persist ◄── runaway ◄── engine ─► parse ─► state machine ─► working set
//! ```
//!
//! Ticks never overlap and never end the process. Failures are absorbed by the
//! breaker, the backoff policy and the runaway detector.

pub mod health;
pub mod interval;
pub mod learning;
pub mod orchestrator;
pub mod working_set;

pub use health::{HealthHandle, HealthReport, HealthStatus, write_health_file};
pub use interval::{IntervalInputs, IntervalPolicy};
pub use learning::{LearningEventEmitter, RunawayContext};
pub use orchestrator::{GateReason, Ports, TickOrchestrator, TickOutcome};
pub use working_set::WorkingSetStore;
