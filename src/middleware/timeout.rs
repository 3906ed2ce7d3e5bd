//! Client deadline propagation.
//!
//! A client may bound how long the gateway spends on its request with
//! `X-Request-Timeout: <milliseconds>`. The value caps the backend call
//! including retries; it never extends `UPSTREAM_TIMEOUT_MS`.
//!
//! Values outside `[MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS]` are
//! clamped to the nearest bound. Unparseable values are ignored.

use std::time::Duration;

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// Minimum allowed request timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum allowed request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Deadline requested by the client, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDeadline(pub Duration);

impl ClientDeadline {
    /// Clamp `ms` into the allowed range.
    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(
            ms.clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS),
        ))
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let raw = headers.get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?.trim();
        let Ok(ms) = raw.parse::<u64>() else {
            debug!(value = raw, "Invalid X-Request-Timeout header value, ignoring");
            return None;
        };
        let deadline = Self::from_millis(ms);
        if deadline.0.as_millis() != u128::from(ms) {
            debug!(
                timeout_ms = ms,
                min = MIN_REQUEST_TIMEOUT_MS,
                max = MAX_REQUEST_TIMEOUT_MS,
                "Client timeout outside allowed range, clamping"
            );
        }
        Some(deadline)
    }
}

/// Middleware that parses `X-Request-Timeout` and stores a
/// [`ClientDeadline`] extension when the header is numeric.
pub async fn extract_client_deadline(mut request: Request, next: Next) -> Response {
    if let Some(deadline) = ClientDeadline::from_headers(request.headers()) {
        request.extensions_mut().insert(deadline);
    }
    next.run(request).await
}
