//! Mock reasoning engine for deterministic testing.
//!
//! Returns pre-configured replies without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_core::{EnvironmentSnapshot, PulseError, Result, StateTransitionRequest};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::provider::{EngineReply, ReasoningEngine};

/// A pre-configured reply from the mock engine.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Raw reply text, returned as-is.
    Body(String),
    /// Fail the call with this message.
    Error(String),
    /// Sleep before answering with the inner reply.
    Delay(Duration, Box<MockReply>),
}

/// A mock engine that pops queued replies in order.
///
/// With an empty queue it answers "continue in the current state".
///
/// # Example
/// ```
/// use pulse_engine::MockEngine;
/// let engine = MockEngine::new("test")
///     .with_body(r#"{"desired_state":"thinking","transition_type":"explore"}"#);
/// ```
#[derive(Clone)]
pub struct MockEngine {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Every snapshot received, for assertions in tests.
    pub requests: Arc<Mutex<Vec<EnvironmentSnapshot>>>,
    name: String,
}

impl MockEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            name: name.into(),
        }
    }

    /// Queue a raw reply body.
    pub fn with_body(self, body: impl Into<String>) -> Self {
        self.push(MockReply::Body(body.into()));
        self
    }

    /// Queue a reply serialised from a request.
    pub fn with_request(self, request: &StateTransitionRequest) -> Self {
        let body = serde_json::to_string(request).unwrap_or_default();
        self.push(MockReply::Body(body));
        self
    }

    /// Queue a failed call.
    pub fn with_error(self, error: &str) -> Self {
        self.push(MockReply::Error(error.to_string()));
        self
    }

    /// Queue a reply that only arrives after `delay`.
    pub fn with_delay(self, delay: Duration, reply: MockReply) -> Self {
        self.push(MockReply::Delay(delay, Box::new(reply)));
        self
    }

    /// Queue a reply on a shared handle.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl ReasoningEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, snapshot: &EnvironmentSnapshot) -> Result<EngineReply> {
        self.requests.lock().push(snapshot.clone());
        let next = self.replies.lock().pop_front();

        let mut reply = match next {
            Some(r) => r,
            None => {
                let req = StateTransitionRequest::continue_in(snapshot.current_state);
                MockReply::Body(serde_json::to_string(&req)?)
            }
        };
        loop {
            match reply {
                MockReply::Body(body) => {
                    return Ok(EngineReply {
                        body,
                        latency_ms: 0,
                    });
                }
                MockReply::Error(e) => return Err(PulseError::Engine(e)),
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
