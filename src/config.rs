//! Gateway configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! Process-level settings come from environment variables (or a `.env` file)
//! with defaults suited to local development. The route table itself lives in
//! a YAML file pointed to by `ROUTES_CONFIG_PATH`; see [`crate::routing::loader`].
//!
//! # Authentication
//!
//! - `JWT_SECRET`: When set, bearer tokens are verified locally (HMAC). When
//!   unset, every bearer token is sent to the Auth Service `verify-token` endpoint
//! - `AUTH_UNAVAILABLE_STATUS`: Status returned when the Auth Service cannot be
//!   reached (`401` default, or `503`)
//!
//! # Resilience Tuning
//!
//! - `RATE_LIMIT_PER_PERIOD` / `RATE_LIMIT_PERIOD_SECS`: default quota (10 per 60s)
//! - `CIRCUIT_BREAKER_FAILURE_THRESHOLD`: failures within the window before opening (default: 5)
//! - `RETRY_MAX_ATTEMPTS`: retries after the first backend attempt (default: 3)

use std::env;
use std::time::Duration;

use axum::http::StatusCode;

use crate::error::{GatewayError, GatewayResult};

/// Status policy applied when the Auth Service itself is unreachable.
///
/// Both variants fail closed; they only differ in what the client is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthUnavailablePolicy {
    /// Report as an authentication failure (401).
    #[default]
    Unauthorized,
    /// Report as a temporary outage (503).
    ServiceUnavailable,
}

impl AuthUnavailablePolicy {
    pub fn status(self) -> StatusCode {
        match self {
            AuthUnavailablePolicy::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthUnavailablePolicy::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::str::FromStr for AuthUnavailablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "401" => Ok(AuthUnavailablePolicy::Unauthorized),
            "503" => Ok(AuthUnavailablePolicy::ServiceUnavailable),
            other => Err(format!("expected 401 or 503, got '{other}'")),
        }
    }
}

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default).
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

/// Gateway configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Path to the YAML route table (default: "config/routes.yaml")
    pub routes_config_path: String,

    /// Maximum request body size in bytes buffered for forwarding (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Authentication Configuration
    // =========================================================================
    /// Base URL of the Auth Service (default: "http://localhost:8081")
    pub auth_service_url: String,

    /// Shared HMAC secret for local bearer token verification.
    /// When `None`, tokens are verified remotely by the Auth Service.
    pub jwt_secret: Option<String>,

    /// Timeout for each Auth Service round-trip (default: 2s)
    pub auth_timeout: Duration,

    /// Status returned when the Auth Service is unreachable (default: 401)
    pub auth_unavailable_policy: AuthUnavailablePolicy,

    /// Credential failures allowed per client IP per minute before the IP is
    /// blocked from further attempts (default: 10, 0 = guard disabled)
    pub auth_failure_limit_per_minute: u32,

    // =========================================================================
    // Upstream Configuration
    // =========================================================================
    /// Per-attempt timeout for backend calls (default: 5s)
    pub upstream_timeout: Duration,

    /// Retries after the first attempt for retry-eligible requests (default: 3)
    pub retry_max_attempts: u32,

    /// Base delay between retries (exponential backoff applies)
    pub retry_base_delay: Duration,

    /// Maximum delay between retries
    pub retry_max_delay: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Default tokens per period for each identity (default: 10)
    pub rate_limit_per_period: u32,

    /// Length of one rate limit window (default: 60s)
    pub rate_limit_period: Duration,

    /// Bounded wait for a bucket lock before rejecting (default: 100ms)
    pub rate_limit_lock_timeout: Duration,

    /// Buckets idle longer than this are evicted (default: 600s, must exceed the period)
    pub rate_limit_idle_ttl: Duration,

    /// How often the idle bucket sweeper runs (default: 60s)
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Failures within the rolling window before the circuit opens (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Rolling window over which failures are counted (default: 60s)
    pub circuit_breaker_window: Duration,

    /// How long the circuit stays open before a half-open probe (default: 30s)
    pub circuit_breaker_reset_timeout: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Token required in `X-Admin-Token` for `/admin/*` endpoints.
    /// Admin endpoints are disabled when unset.
    pub admin_token: Option<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges. `X-Forwarded-For` / `X-Real-IP` are only
    /// honoured when the TCP peer falls inside one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarded headers are ignored, the peer address is used)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if any value fails to parse or the
    /// combination is inconsistent (e.g. idle TTL shorter than the period).
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,
            routes_config_path: env::var("ROUTES_CONFIG_PATH")
                .unwrap_or_else(|_| "config/routes.yaml".to_string()),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?, // 10MB

            // Authentication
            auth_service_url: env::var("AUTH_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string())
                .trim_end_matches('/')
                .to_string(),
            jwt_secret: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            auth_timeout: Duration::from_millis(Self::parse_env("AUTH_TIMEOUT_MS", 2000)?),
            auth_unavailable_policy: Self::parse_env(
                "AUTH_UNAVAILABLE_STATUS",
                AuthUnavailablePolicy::default(),
            )?,
            auth_failure_limit_per_minute: Self::parse_env("AUTH_FAILURE_LIMIT_PER_MINUTE", 10)?,

            // Upstream
            upstream_timeout: Duration::from_millis(Self::parse_env("UPSTREAM_TIMEOUT_MS", 5000)?),
            retry_max_attempts: Self::parse_env("RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(Self::parse_env("RETRY_BASE_DELAY_MS", 50)?),
            retry_max_delay: Duration::from_millis(Self::parse_env("RETRY_MAX_DELAY_MS", 1000)?),

            // Rate limiting
            rate_limit_per_period: Self::parse_env("RATE_LIMIT_PER_PERIOD", 10)?,
            rate_limit_period: Duration::from_secs(Self::parse_env("RATE_LIMIT_PERIOD_SECS", 60)?),
            rate_limit_lock_timeout: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_LOCK_TIMEOUT_MS",
                100,
            )?),
            rate_limit_idle_ttl: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_IDLE_TTL_SECS",
                600,
            )?),
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_window: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_WINDOW_SECS",
                60,
            )?),
            circuit_breaker_reset_timeout: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_SECS",
                30,
            )?),

            // Security
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::default())?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if validation fails.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.retry_base_delay > self.retry_max_delay {
            return Err(GatewayError::Config(format!(
                "RETRY_BASE_DELAY_MS ({:?}) must be <= RETRY_MAX_DELAY_MS ({:?})",
                self.retry_base_delay, self.retry_max_delay
            )));
        }

        if self.rate_limit_per_period == 0 {
            return Err(GatewayError::Config(
                "RATE_LIMIT_PER_PERIOD must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_period.is_zero() {
            return Err(GatewayError::Config(
                "RATE_LIMIT_PERIOD_SECS must be greater than 0".to_string(),
            ));
        }

        // A bucket evicted mid-window would hand its owner a fresh quota.
        if self.rate_limit_idle_ttl <= self.rate_limit_period {
            return Err(GatewayError::Config(format!(
                "RATE_LIMIT_IDLE_TTL_SECS ({}) must exceed RATE_LIMIT_PERIOD_SECS ({})",
                self.rate_limit_idle_ttl.as_secs(),
                self.rate_limit_period.as_secs()
            )));
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(GatewayError::Config(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout.is_zero() || self.auth_timeout.is_zero() {
            return Err(GatewayError::Config(
                "UPSTREAM_TIMEOUT_MS and AUTH_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the `/admin/*` endpoints are enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_token.is_some()
    }

    /// Check if the per-IP authentication failure guard is enabled.
    pub fn auth_failure_guard_enabled(&self) -> bool {
        self.auth_failure_limit_per_minute > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            routes_config_path: "config/routes.yaml".to_string(),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Authentication
            auth_service_url: "http://localhost:8081".to_string(),
            jwt_secret: None,
            auth_timeout: Duration::from_secs(2),
            auth_unavailable_policy: AuthUnavailablePolicy::Unauthorized,
            auth_failure_limit_per_minute: 10,
            // Upstream
            upstream_timeout: Duration::from_secs(5),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
            // Rate limiting
            rate_limit_per_period: 10,
            rate_limit_period: Duration::from_secs(60),
            rate_limit_lock_timeout: Duration::from_millis(100),
            rate_limit_idle_ttl: Duration::from_secs(600),
            rate_limit_sweep_interval: Duration::from_secs(60),
            // Circuit breaker
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_window: Duration::from_secs(60),
            circuit_breaker_reset_timeout: Duration::from_secs(30),
            // Security
            admin_token: None,
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
