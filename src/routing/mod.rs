//! Route table: path matching, rewrite rules, YAML loading and hot reload.
//!
//! The active [`RoutingSnapshot`] is immutable. A reload builds a complete new
//! snapshot and swaps the `Arc` in one step, so a request always sees either
//! the old table or the new one, never a mix.

pub mod loader;
pub mod pattern;
pub mod table;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::gateway::circuit_breaker::CircuitBreakerConfig;
use crate::gateway::fallback::FallbackCatalog;
use crate::gateway::rate_limiter::Quota;

pub use pattern::{PathPattern, PatternError, RewriteRule, has_dot_segment};
pub use table::{AuthScheme, Route, RouteMatch, RouteTable};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("failed to read route file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse route file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("route '{route}': {source}")]
    InvalidPattern {
        route: String,
        #[source]
        source: PatternError,
    },

    #[error("duplicate route id '{0}'")]
    DuplicateRouteId(String),

    #[error("route '{route}' targets service '{service}' which has no backend URL")]
    UnknownBackend { route: String, service: String },

    #[error("route '{route}' references unknown fallback '{fallback}'")]
    UnknownFallback { route: String, fallback: String },

    #[error("backend '{service}' has an invalid URL: {reason}")]
    InvalidBackendUrl { service: String, reason: String },

    #[error("fallback '{fallback}' has non-error status {status}")]
    InvalidFallbackStatus { fallback: String, status: u16 },

    #[error("{section}.{field} must be greater than 0")]
    InvalidLimit {
        section: &'static str,
        field: &'static str,
    },
}

impl From<RoutingError> for crate::error::GatewayError {
    fn from(err: RoutingError) -> Self {
        crate::error::GatewayError::Config(err.to_string())
    }
}

/// Rate limit and circuit breaker values set in the route file.
///
/// Each field overrides the matching environment default; unset fields fall
/// back to it. They travel with the snapshot so a reload changes them together
/// with the routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub rate_limit_per_period: Option<u32>,
    pub rate_limit_period: Option<Duration>,
    pub breaker_failure_threshold: Option<u32>,
    pub breaker_window: Option<Duration>,
    pub breaker_reset_timeout: Option<Duration>,
}

impl LimitOverrides {
    /// Global quota for identities without an API key or route override.
    pub fn quota(&self, base: Quota) -> Quota {
        Quota::new(
            self.rate_limit_per_period.unwrap_or(base.capacity),
            self.rate_limit_period.unwrap_or(base.period),
        )
    }

    pub fn breaker(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.breaker_failure_threshold.unwrap_or(base.failure_threshold),
            self.breaker_window.unwrap_or(base.window),
            self.breaker_reset_timeout.unwrap_or(base.reset_timeout),
        )
    }
}

/// Everything a request needs from configuration, captured at one instant.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub table: RouteTable,
    pub fallbacks: FallbackCatalog,
    /// Static resolver: logical service name to base URL (no trailing slash).
    pub backends: HashMap<String, String>,
    pub limits: LimitOverrides,
}

impl RoutingSnapshot {
    pub fn resolve_backend(&self, service: &str) -> Option<&str> {
        self.backends.get(service).map(String::as_str)
    }
}

/// Summary returned after a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub routes: usize,
    pub backends: usize,
    pub fallbacks: usize,
}

/// The live routing snapshot plus the file it was loaded from.
#[derive(Debug)]
pub struct SharedRouting {
    current: RwLock<Arc<RoutingSnapshot>>,
    source: Option<PathBuf>,
}

impl SharedRouting {
    /// Wrap an in-memory snapshot. `reload` is unavailable without a source file.
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: None,
        }
    }

    /// Load the initial snapshot from `path` and remember it for reloads.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError` if the file is missing or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = RoutingSnapshot::from_file(&path)?;
        info!(
            path = %path.display(),
            routes = snapshot.table.len(),
            backends = snapshot.backends.len(),
            "Route table loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: Some(path),
        })
    }

    /// Current snapshot. Callers hold the `Arc` for the whole request.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Install a new snapshot.
    pub fn replace(&self, snapshot: RoutingSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Re-read the source file. On any error the active snapshot is kept and
    /// the error is returned for the caller to report.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError` if there is no source file or it fails validation.
    pub fn reload(&self) -> Result<ReloadSummary, RoutingError> {
        let Some(path) = self.source.as_ref() else {
            return Err(RoutingError::Io {
                path: "<in-memory>".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "route table was not loaded from a file",
                ),
            });
        };

        let snapshot = RoutingSnapshot::from_file(path)?;
        let summary = ReloadSummary {
            routes: snapshot.table.len(),
            backends: snapshot.backends.len(),
            fallbacks: snapshot.fallbacks.len(),
        };
        self.replace(snapshot);
        info!(
            path = %path.display(),
            routes = summary.routes,
            "Route table reloaded"
        );
        Ok(summary)
    }
}
