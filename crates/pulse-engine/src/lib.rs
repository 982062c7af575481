//! # pulse-engine
//!
//! The boundary to the external reasoning engine. The runtime hands it an
//! `EnvironmentSnapshot` and gets back raw text, which `parse_transition_request`
//! turns into an untrusted `StateTransitionRequest`.

pub mod http;
pub mod mock;
pub mod parse;
pub mod provider;

pub use http::HttpEngine;
pub use mock::{MockEngine, MockReply};
pub use parse::parse_transition_request;
pub use provider::{EngineReply, ReasoningEngine, build_engine};
