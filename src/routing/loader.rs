//! YAML route table loading and validation.
//!
//! ```yaml
//! backends:
//!   customer-service: http://customer-service:8082
//! routes:
//!   - id: customer-service
//!     path: /api/v1/customers/**
//!     service: customer-service
//!     auth: BEARER
//!     fallback: customer
//! fallbacks:
//!   customer:
//!     message: Customer Service is currently unavailable
//! # Optional, override the environment defaults and reload with the routes.
//! rate_limit:
//!   per_period: 10
//!   period_secs: 60
//! circuit_breaker:
//!   failure_threshold: 5
//!   window_secs: 60
//!   reset_timeout_secs: 30
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;

use super::pattern::{PathPattern, RewriteRule};
use super::table::{AuthScheme, Route, RouteTable};
use super::{LimitOverrides, RoutingError, RoutingSnapshot};
use crate::gateway::fallback::{FallbackCatalog, FallbackResponse};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutesFile {
    #[serde(default)]
    backends: BTreeMap<String, String>,
    routes: Vec<RouteDefinition>,
    #[serde(default)]
    fallbacks: BTreeMap<String, FallbackDefinition>,
    #[serde(default)]
    rate_limit: Option<RateLimitDefinition>,
    #[serde(default)]
    circuit_breaker: Option<CircuitBreakerDefinition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitDefinition {
    per_period: Option<u32>,
    period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CircuitBreakerDefinition {
    failure_threshold: Option<u32>,
    window_secs: Option<u64>,
    reset_timeout_secs: Option<u64>,
}

fn positive_u32(
    value: Option<u32>,
    section: &'static str,
    field: &'static str,
) -> Result<Option<u32>, RoutingError> {
    match value {
        Some(0) => Err(RoutingError::InvalidLimit { section, field }),
        other => Ok(other),
    }
}

fn positive_secs(
    value: Option<u64>,
    section: &'static str,
    field: &'static str,
) -> Result<Option<Duration>, RoutingError> {
    match value {
        Some(0) => Err(RoutingError::InvalidLimit { section, field }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

fn limit_overrides(
    rate_limit: Option<RateLimitDefinition>,
    circuit_breaker: Option<CircuitBreakerDefinition>,
) -> Result<LimitOverrides, RoutingError> {
    let rate_limit = rate_limit.unwrap_or_default();
    let circuit_breaker = circuit_breaker.unwrap_or_default();

    Ok(LimitOverrides {
        rate_limit_per_period: positive_u32(rate_limit.per_period, "rate_limit", "per_period")?,
        rate_limit_period: positive_secs(rate_limit.period_secs, "rate_limit", "period_secs")?,
        breaker_failure_threshold: positive_u32(
            circuit_breaker.failure_threshold,
            "circuit_breaker",
            "failure_threshold",
        )?,
        breaker_window: positive_secs(circuit_breaker.window_secs, "circuit_breaker", "window_secs")?,
        breaker_reset_timeout: positive_secs(
            circuit_breaker.reset_timeout_secs,
            "circuit_breaker",
            "reset_timeout_secs",
        )?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteDefinition {
    id: String,
    path: String,
    service: String,
    auth: AuthScheme,
    #[serde(default)]
    rewrite: Option<String>,
    fallback: String,
    #[serde(default)]
    idempotent: bool,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FallbackDefinition {
    #[serde(default = "default_fallback_status")]
    status: u16,
    message: String,
}

fn default_fallback_status() -> u16 {
    503
}

impl RoutingSnapshot {
    /// Load and validate a route table file.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError` if the file cannot be read or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RoutingError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a route table from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError` on parse failure, a bad pattern or rewrite, a
    /// duplicate id, a service without a backend URL, or an unknown fallback.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RoutingError> {
        let file: RoutesFile = serde_yaml::from_str(yaml)?;
        let limits = limit_overrides(file.rate_limit, file.circuit_breaker)?;

        let mut backends = HashMap::with_capacity(file.backends.len());
        for (service, url) in file.backends {
            let parsed = reqwest::Url::parse(&url).map_err(|e| RoutingError::InvalidBackendUrl {
                service: service.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(RoutingError::InvalidBackendUrl {
                    service,
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
            backends.insert(service, url.trim_end_matches('/').to_string());
        }

        let mut fallbacks = HashMap::with_capacity(file.fallbacks.len());
        for (id, def) in file.fallbacks {
            let status = StatusCode::from_u16(def.status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .ok_or_else(|| RoutingError::InvalidFallbackStatus {
                    fallback: id.clone(),
                    status: def.status,
                })?;
            fallbacks.insert(id, FallbackResponse::new(status, def.message));
        }
        let fallbacks = FallbackCatalog::new(fallbacks);

        let mut routes = Vec::with_capacity(file.routes.len());
        for def in file.routes {
            let pattern =
                PathPattern::parse(&def.path).map_err(|e| RoutingError::InvalidPattern {
                    route: def.id.clone(),
                    source: e,
                })?;
            let rewrite = RewriteRule::from_template(def.rewrite.as_deref()).map_err(|e| {
                RoutingError::InvalidPattern {
                    route: def.id.clone(),
                    source: e,
                }
            })?;
            if !backends.contains_key(&def.service) {
                return Err(RoutingError::UnknownBackend {
                    route: def.id,
                    service: def.service,
                });
            }
            if !fallbacks.contains(&def.fallback) {
                return Err(RoutingError::UnknownFallback {
                    route: def.id,
                    fallback: def.fallback,
                });
            }

            routes.push(Route {
                id: def.id,
                pattern,
                service: def.service,
                auth: def.auth,
                rewrite,
                fallback_id: def.fallback,
                idempotent: def.idempotent,
                rate_limit_per_minute: def.rate_limit_per_minute.filter(|limit| *limit > 0),
            });
        }

        Ok(RoutingSnapshot {
            table: RouteTable::new(routes)?,
            fallbacks,
            backends,
            limits,
        })
    }
}
