//! # pulse-cli
//!
//! Command-line interface for the Pulse runtime.
//!
//! ## Commands
//!
//! - `pulse run`: start the tick loop and the health server
//! - `pulse status`: checkpoint, overrides, budget and breaker from the shared store
//! - `pulse config`: print the effective configuration
//! - `pulse pause` / `pulse resume`: toggle the paused override
//! - `pulse safe-mode`: toggle the safe_mode override
//! - `pulse notify`: queue an external event for the next tick
//! - `pulse learning`: list or acknowledge learning events

pub mod commands;

pub use commands::Cli;
