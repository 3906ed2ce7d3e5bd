use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::circuit_breaker::BreakerSnapshot;
use crate::routing::ReloadSummary;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" when no routes are loaded
    pub status: String,
    /// Routes in the active table
    pub routes: usize,
    /// Service version
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Result of `POST /admin/reload`.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub status: String,
    pub routes: usize,
    pub backends: usize,
    pub fallbacks: usize,
    pub timestamp: DateTime<Utc>,
}

impl From<ReloadSummary> for ReloadResponse {
    fn from(summary: ReloadSummary) -> Self {
        Self {
            status: "reloaded".to_string(),
            routes: summary.routes,
            backends: summary.backends,
            fallbacks: summary.fallbacks,
            timestamp: Utc::now(),
        }
    }
}

/// Result of `GET /admin/breakers`, sorted by service name.
#[derive(Debug, Serialize)]
pub struct BreakersResponse {
    pub breakers: Vec<BreakerSnapshot>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_response_from_summary() {
        let response = ReloadResponse::from(ReloadSummary {
            routes: 4,
            backends: 3,
            fallbacks: 4,
        });
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"], "reloaded");
        assert_eq!(json["routes"], 4);
        assert_eq!(json["backends"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            routes: 4,
            version: "0.1.0".to_string(),
            uptime_seconds: 12,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"uptime_seconds\":12"));
    }
}
