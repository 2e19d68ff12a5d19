//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::shard::{ShardSnapshot, ShardState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub total_shards: u32,
    pub shards_local: usize,
    pub shards_ready: usize,
    pub shards_closed: usize,
    pub events_received: u64,
}

/// Per-shard status response
#[derive(Debug, Serialize)]
pub struct ShardsResponse {
    pub total_shards: u32,
    pub shards: Vec<ShardSnapshot>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/shards", get(shards_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shards_ready = state.shard_state.ready_shards();

    let response = ReadyResponse {
        ready: shards_ready > 0,
        total_shards: state.shard_state.total_shards(),
        shards_local: state.shard_state.shard_count(),
        shards_ready,
        shards_closed: state.shard_state.closed_shards(),
        events_received: state.shard_state.total_events_received(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_shards_ready(state.shard_state.ready_shards());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

async fn shards_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ShardsResponse {
        total_shards: state.shard_state.total_shards(),
        shards: state.shard_state.snapshots(),
    })
}
