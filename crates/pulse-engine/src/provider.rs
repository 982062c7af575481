use async_trait::async_trait;
use pulse_config::EngineConfig;
use pulse_core::{EnvironmentSnapshot, PulseError, Result};
use std::sync::Arc;
use tracing::info;

use crate::http::HttpEngine;
use crate::mock::MockEngine;

/// Raw response from one engine call.
#[derive(Debug, Clone)]
pub struct EngineReply {
    pub body: String,
    pub latency_ms: u64,
}

/// Trait implemented by anything that can decide what the runtime does next.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Human-readable name, e.g. "http" or "mock".
    fn name(&self) -> &str;

    /// Hand over the snapshot and return the raw reply text.
    async fn invoke(&self, snapshot: &EnvironmentSnapshot) -> Result<EngineReply>;

    /// Check if the engine is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Build the engine named by `engine.provider`.
pub fn build_engine(config: &EngineConfig) -> Result<Arc<dyn ReasoningEngine>> {
    match config.provider.as_str() {
        "http" => {
            info!(endpoint = %config.endpoint, model = %config.model, "using HTTP reasoning engine");
            Ok(Arc::new(HttpEngine::new(
                config.endpoint.clone(),
                config.model.clone(),
                config.api_key.clone(),
            )))
        }
        "mock" => {
            info!("using mock reasoning engine");
            Ok(Arc::new(MockEngine::new("mock")))
        }
        other => Err(PulseError::Config(format!(
            "unknown engine provider '{other}'"
        ))),
    }
}
