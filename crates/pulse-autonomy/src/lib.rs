//! # pulse-autonomy
//!
//! The self-regulation pieces of the Pulse runtime: the shared-quota budget
//! tracker, the reasoning-engine circuit breaker and backoff curve, the
//! lifecycle state machine, and the runaway detector.

pub mod backoff;
pub mod breaker;
pub mod budget;
pub mod runaway;
pub mod state_machine;

pub use backoff::Backoff;
pub use breaker::{CircuitBreaker, REASONING_ENGINE};
pub use budget::BudgetTracker;
pub use runaway::{RunawayDetector, TickRecord};
pub use state_machine::{RejectionReason, StateMachine};
