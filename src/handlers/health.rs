//! Liveness and readiness endpoints.
//!
//! - `GET /health` - always 200 while the process runs; reports "degraded"
//!   when the active route table is empty
//! - `GET /ready` - 503 until at least one route is loaded

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// ```json
/// {
///   "status": "healthy",
///   "routes": 4,
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let routes = state.gateway.routing().snapshot().table.len();

    Json(HealthResponse {
        status: if routes > 0 { "healthy" } else { "degraded" }.to_string(),
        routes,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for load balancer and Kubernetes probes.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.gateway.routing().snapshot().table.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}
