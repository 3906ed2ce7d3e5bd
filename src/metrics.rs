//! Prometheus metrics for the gateway.
//!
//! Metrics are exposed on a dedicated listener (`METRICS_PORT`, `0` disables).
//! Recording functions are safe to call when no exporter is installed; the
//! `metrics` facade discards the values.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_requests_total` - Requests by route, outcome and status
//! - `gateway_rate_limited_total` - Requests rejected by the rate limiter (label: route)
//! - `gateway_auth_failures_total` - Failed authentications (labels: scheme, reason)
//! - `gateway_upstream_retries_total` - Backend retries (label: service)
//! - `gateway_circuit_breaker_opens_total` - Times a breaker opened (label: service)
//! - `gateway_circuit_breaker_rejections_total` - Calls short-circuited (label: service)
//! - `gateway_route_reloads_total` - Route table reloads (label: result)
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - End-to-end latency (labels: route, outcome)
//!
//! ## Gauges
//! - `gateway_circuit_breaker_state` - 0 = closed, 1 = half-open, 2 = open (label: service)
//! - `gateway_rate_limiter_buckets` - Live rate limiter buckets

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::gateway::circuit_breaker::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
    pub const UPSTREAM_RETRIES_TOTAL: &str = "gateway_upstream_retries_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "gateway_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "gateway_circuit_breaker_rejections_total";
    pub const ROUTE_RELOADS_TOTAL: &str = "gateway_route_reloads_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
    pub const RATE_LIMITER_BUCKETS: &str = "gateway_rate_limiter_buckets";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter (or its listener) cannot be installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Requests handled by the gateway pipeline"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected by the per-identity rate limiter"
    );
    describe_counter!(names::AUTH_FAILURES_TOTAL, "Failed authentications");
    describe_counter!(
        names::UPSTREAM_RETRIES_TOTAL,
        "Retries of backend calls"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times a circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of calls rejected by a circuit breaker"
    );
    describe_counter!(names::ROUTE_RELOADS_TOTAL, "Route table reload attempts");

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Gateway request duration in seconds"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(
        names::RATE_LIMITER_BUCKETS,
        "Rate limiter buckets currently held in memory"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Record a completed request. `route` is the route id, or `"unmatched"`.
pub fn record_request(route: &str, outcome: &str, status: u16, duration_secs: f64) {
    counter!(names::REQUESTS_TOTAL, "route" => route.to_string(), "outcome" => outcome.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "route" => route.to_string(), "outcome" => outcome.to_string())
        .record(duration_secs);
}

pub fn record_rate_limit_rejection(route: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn record_auth_failure(scheme: &str, reason: &str) {
    counter!(names::AUTH_FAILURES_TOTAL, "scheme" => scheme.to_string(), "reason" => reason.to_string())
        .increment(1);
}

pub fn record_upstream_retry(service: &str) {
    counter!(names::UPSTREAM_RETRIES_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn set_rate_limiter_buckets(count: usize) {
    gauge!(names::RATE_LIMITER_BUCKETS).set(count as f64);
}

/// `result` is `"success"` or `"error"`.
pub fn record_route_reload(result: &str) {
    counter!(names::ROUTE_RELOADS_TOTAL, "result" => result.to_string()).increment(1);
}

// =============================================================================
// Circuit Breakers
// =============================================================================

pub fn record_circuit_breaker_open(service: &str) {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_circuit_breaker_rejection(service: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL, "service" => service.to_string())
        .increment(1);
}

pub fn set_circuit_breaker_state(service: &str, state: CircuitState) {
    gauge!(names::CIRCUIT_BREAKER_STATE, "service" => service.to_string())
        .set(f64::from(state.as_gauge()));
}
