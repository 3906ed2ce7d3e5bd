//! Operator endpoints, protected by `X-Admin-Token`.
//!
//! When `ADMIN_TOKEN` is unset these endpoints answer 404 as if they did not
//! exist.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use crate::error::{ErrorBody, GatewayError};
use crate::models::{BreakersResponse, ReloadResponse};
use crate::state::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Constant-time comparison of the presented token with the configured one.
fn authorize(state: &AppState, headers: &HeaderMap, path: &str) -> Result<(), GatewayError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(GatewayError::NoRouteMatched(path.to_string()));
    };

    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        warn!(path, "Rejected admin request with invalid token");
        Err(GatewayError::AuthRejected("Invalid admin token".to_string()))
    }
}

/// `POST /admin/reload` - re-read the route table file.
///
/// A rejected file leaves the active table untouched and answers 422 with
/// the validation error.
#[instrument(skip_all)]
pub async fn reload_routes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers, "/admin/reload") {
        return e.into_response();
    }

    match state.reload_routes() {
        Ok(summary) => {
            info!(routes = summary.routes, "Route table reloaded via admin endpoint");
            Json(ReloadResponse::from(summary)).into_response()
        }
        Err(e) => ErrorBody::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Route table rejected: {e}"),
        )
        .into_response_with(StatusCode::UNPROCESSABLE_ENTITY),
    }
}

/// `GET /admin/breakers` - state of every circuit breaker created so far.
#[instrument(skip_all)]
pub async fn list_breakers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers, "/admin/breakers") {
        return e.into_response();
    }

    Json(BreakersResponse {
        breakers: state.gateway.breakers().snapshot(),
        timestamp: Utc::now(),
    })
    .into_response()
}
