//! # pulse-server
//!
//! Liveness surface for the Pulse runtime:
//!
//! - `GET /health`: the latest `HealthReport` as JSON
//! - `GET /metrics`: Prometheus text exposition

pub mod metrics;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::Json,
    routing::get,
};
use pulse_core::{PulseError, Result};
use pulse_runtime::{HealthHandle, HealthReport};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use metrics::{Metrics, spawn_metrics_listener};

/// Shared server state.
pub struct AppState {
    pub health: HealthHandle,
    pub metrics: Metrics,
}

#[derive(Serialize)]
struct HealthResponse {
    version: &'static str,
    #[serde(flatten)]
    report: HealthReport,
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    state.metrics.inc_http_requests();
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        report: state.health.snapshot(),
    })
}

/// Prometheus-compatible metrics endpoint.
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    state.metrics.inc_http_requests();
    let body = state.metrics.render_prometheus(&state.health.snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Serve until `shutdown` fires.
pub async fn start_server(
    listen: &str,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = build_router(state);

    info!(listen = %listen, "starting health server");

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| PulseError::Config(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
