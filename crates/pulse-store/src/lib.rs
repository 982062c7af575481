//! # pulse-store
//!
//! SQLite-backed shared store for the Pulse runtime: the cross-process budget
//! ledger, the runtime checkpoint, operator overrides, persisted breaker state,
//! the external-event queue and the append-only learning-event log.

pub mod audit;
pub mod ledger;
pub mod learning;
pub mod store;

pub use audit::AuditMirror;
pub use store::Store;
