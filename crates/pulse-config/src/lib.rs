//! # pulse-config
//!
//! Configuration system for the Pulse runtime. Reads `pulse.toml` once at startup,
//! then applies environment variable overrides and validates the result.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::PulseConfig;
pub use schema::{
    BackoffConfig, BudgetConfig, CircuitBreakerConfig, ConfigWarning, EngineConfig, HealthConfig,
    LoggingConfig, LoopConfig, ProgressConfig, RunawayConfig, RunawayWeights, StatesConfig,
    StorageConfig, WarningSeverity,
};
