use async_trait::async_trait;
use pulse_core::{EnvironmentSnapshot, PulseError, Result};
use std::time::Instant;
use tracing::debug;

use crate::provider::{EngineReply, ReasoningEngine};

/// Reasoning engine reached over HTTP.
///
/// POSTs `{ "model": ..., "snapshot": ... }` as JSON and returns the response
/// body untouched; parsing happens in the runtime.
pub struct HttpEngine {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEngine {
    pub fn new(endpoint: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            model,
            api_key,
        }
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let req = self.client.post(&self.endpoint);
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }
}

#[async_trait]
impl ReasoningEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, snapshot: &EnvironmentSnapshot) -> Result<EngineReply> {
        let body = serde_json::json!({
            "model": self.model,
            "snapshot": snapshot,
        });

        let started = Instant::now();
        let resp = self
            .post()
            .json(&body)
            .send()
            .await
            .map_err(|e| PulseError::Engine(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PulseError::Engine(format!("HTTP {status}: {text}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| PulseError::Engine(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(tick_id = %snapshot.tick_id, latency_ms, bytes = text.len(), "engine replied");

        Ok(EngineReply {
            body: text,
            latency_ms,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| PulseError::Engine(e.to_string()))?;
        if resp.status().is_server_error() {
            return Err(PulseError::Engine(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}
