use thiserror::Error;

/// Unified error type for the entire Pulse runtime.
#[derive(Error, Debug)]
pub enum PulseError {
    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Storage errors ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    // ── Reasoning engine errors ────────────────────────────────
    #[error("reasoning engine error: {0}")]
    Engine(String),

    #[error("reasoning engine timed out after {secs}s")]
    EngineTimeout { secs: u64 },

    #[error("reasoning engine response could not be parsed: {0}")]
    EngineParse(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PulseError {
    /// Whether this error should count against the reasoning engine's circuit breaker.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self,
            PulseError::Engine(_) | PulseError::EngineTimeout { .. } | PulseError::EngineParse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
