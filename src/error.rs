use axum::http::header::{HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error kinds.
///
/// Every variant is recovered at the dispatch boundary into a deterministic
/// HTTP response. The `Display` text is for server-side logs only; clients
/// receive the sanitized message from [`GatewayError::client_message`].
///
/// # Authentication
///
/// - `AuthRejected` - bad, missing or expired credential (terminal, 401)
/// - `AuthServiceUnavailable` - the verification round-trip itself failed.
///   Fail closed; the response status is chosen by policy (401 or 503)
///
/// # Backends
///
/// - `BreakerOpen` - backend known unhealthy, no call attempted
/// - `BackendError` - call completed with a failure status or transport error
/// - `UpstreamTimeout` - the final attempt exceeded its deadline
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Auth service unavailable: {0}")]
    AuthServiceUnavailable(String),

    #[error("Rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64, limit: u32 },

    #[error("Circuit breaker open for service '{0}'")]
    BreakerOpen(String),

    #[error("Backend '{service}' failed: {detail}")]
    BackendError { service: String, detail: String },

    #[error("Backend '{0}' timed out")]
    UpstreamTimeout(String),

    #[error("No route matched path '{0}'")]
    NoRouteMatched(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Structured JSON body for every gateway-decided response.
///
/// ```json
/// {
///   "timestamp": "2024-01-15T10:30:00Z",
///   "status": 503,
///   "error": "Service Unavailable",
///   "message": "Customer Service is currently unavailable"
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub timestamp: String,
    pub status: u16,
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            status: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: message.into(),
        }
    }

    /// Render this body with the status it carries.
    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, axum::Json(self)).into_response()
    }
}

impl GatewayError {
    /// Default HTTP status for this error kind.
    ///
    /// `AuthServiceUnavailable` defaults to 401 (fail closed); the gateway may
    /// override it with the configured policy via [`GatewayError::into_response_as`].
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthRejected(_) | GatewayError::AuthServiceUnavailable(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BreakerOpen(_) | GatewayError::BackendError { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::NoRouteMatched(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short outcome label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthRejected(_) => "auth_rejected",
            GatewayError::AuthServiceUnavailable(_) => "auth_service_unavailable",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BreakerOpen(_) => "breaker_open",
            GatewayError::BackendError { .. } => "backend_error",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::NoRouteMatched(_) => "no_route",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Client-facing message. Never includes backend or credential details.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::AuthRejected(reason) => reason.clone(),
            GatewayError::AuthServiceUnavailable(_) => {
                "Unable to verify credentials at this time".to_string()
            }
            GatewayError::RateLimited { .. } => {
                "Rate limit exceeded. Please retry later.".to_string()
            }
            GatewayError::BreakerOpen(_) | GatewayError::BackendError { .. } => {
                "Service is currently unavailable".to_string()
            }
            GatewayError::UpstreamTimeout(_) => {
                "The upstream service did not respond in time".to_string()
            }
            GatewayError::NoRouteMatched(_) => "No route matches the requested path".to_string(),
            GatewayError::PayloadTooLarge(limit) => {
                format!("Request body exceeds the {limit} byte limit")
            }
            GatewayError::Config(_) => "Gateway configuration error".to_string(),
            GatewayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Render with an explicit status, keeping kind-specific headers.
    pub fn into_response_as(self, status: StatusCode) -> Response {
        let mut response = ErrorBody::new(status, self.client_message()).into_response_with(status);
        let headers = response.headers_mut();

        match &self {
            GatewayError::RateLimited {
                retry_after_secs,
                limit,
            } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            }
            GatewayError::AuthRejected(_) if status == StatusCode::UNAUTHORIZED => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer, API-Key"));
            }
            _ => {}
        }

        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.into_response_as(status)
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;
