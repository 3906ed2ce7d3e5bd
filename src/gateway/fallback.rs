//! Static fallback responses served when a backend is unavailable.
//!
//! Fallbacks are configuration, never derived from backend data: the body is
//! always the gateway's own `{timestamp, status, error, message}` shape.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::Response;

use crate::error::ErrorBody;

/// A configured fallback: status plus client-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackResponse {
    pub status: StatusCode,
    pub message: String,
}

impl FallbackResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Generic 503 used when a route's fallback id is somehow missing.
    pub fn service_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is currently unavailable",
        )
    }

    pub fn render(&self) -> Response {
        ErrorBody::new(self.status, self.message.clone()).into_response_with(self.status)
    }
}

/// Fallbacks keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FallbackCatalog {
    entries: HashMap<String, FallbackResponse>,
}

impl FallbackCatalog {
    pub fn new(entries: HashMap<String, FallbackResponse>) -> Self {
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<&FallbackResponse> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Resolve a fallback, degrading to the generic 503.
    pub fn resolve(&self, id: &str) -> FallbackResponse {
        self.get(id)
            .cloned()
            .unwrap_or_else(FallbackResponse::service_unavailable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
