//! The gateway request pipeline.
//!
//! ```text
//!  request ──► route lookup ──► auth filter ──► rate limiter ──► breaker + proxy ──► response
//!                  │                │                │                  │
//!                 404          401 / 429            429       fallback (503) / 504
//! ```
//!
//! [`Gateway::dispatch`] never fails: every [`GatewayError`] is turned into a
//! deterministic JSON response at this boundary, and internal detail stays in
//! the logs.

pub mod circuit_breaker;
pub mod fallback;
pub mod proxy;
pub mod rate_limiter;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{
    ApiKeyFilter, AuthFailureGuard, AuthFilterChain, AuthServiceClient, BearerFilter, Identity,
    JwtVerifier, TokenVerifier,
};
use crate::config::{AuthUnavailablePolicy, Config};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware::{ClientDeadline, RequestId, TrustedHop};
use crate::routing::{ReloadSummary, RouteMatch, RoutingError, RoutingSnapshot, SharedRouting};

use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use proxy::{BackendProxy, ForwardRequest, RetryPolicy, upstream_headers};
use rate_limiter::{Quota, RateLimiter};

pub use fallback::{FallbackCatalog, FallbackResponse};

const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Tunables of the pipeline, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub default_quota: Quota,
    pub rate_limit_lock_timeout: Duration,
    pub rate_limit_idle_ttl: Duration,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub upstream_timeout: Duration,
    pub auth_unavailable_policy: AuthUnavailablePolicy,
    pub max_body_size: usize,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_quota: Quota::new(config.rate_limit_per_period, config.rate_limit_period),
            rate_limit_lock_timeout: config.rate_limit_lock_timeout,
            rate_limit_idle_ttl: config.rate_limit_idle_ttl,
            breaker: CircuitBreakerConfig::new(
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_window,
                config.circuit_breaker_reset_timeout,
            ),
            retry: RetryPolicy {
                max_retries: config.retry_max_attempts,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
            upstream_timeout: config.upstream_timeout,
            auth_unavailable_policy: config.auth_unavailable_policy,
            max_body_size: config.max_request_body_size,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the per-request log line and metrics need to know.
#[derive(Default)]
struct RequestTrace {
    identity: Option<String>,
    attempts: u32,
}

/// Orchestrates route lookup, authentication, rate limiting and forwarding.
///
/// Cheap to share: all state lives behind `Arc`s.
#[derive(Clone)]
pub struct Gateway {
    routing: Arc<SharedRouting>,
    auth: AuthFilterChain,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    proxy: BackendProxy,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        routing: Arc<SharedRouting>,
        auth: AuthFilterChain,
        http: reqwest::Client,
        settings: GatewaySettings,
    ) -> Self {
        let breaker = routing.snapshot().limits.breaker(&settings.breaker);
        Self {
            routing,
            auth,
            limiter: Arc::new(RateLimiter::new(
                settings.rate_limit_lock_timeout,
                settings.rate_limit_idle_ttl,
            )),
            breakers: Arc::new(CircuitBreakerRegistry::new(breaker)),
            proxy: BackendProxy::new(http, settings.retry, settings.upstream_timeout),
            settings,
        }
    }

    /// Wire the pipeline from configuration.
    ///
    /// Bearer tokens are verified locally when `JWT_SECRET` is set, otherwise
    /// by the Auth Service. API keys are always validated remotely.
    pub fn from_config(config: &Config, routing: Arc<SharedRouting>, http: reqwest::Client) -> Self {
        let auth_client = Arc::new(AuthServiceClient::new(
            http.clone(),
            config.auth_service_url.clone(),
            config.auth_timeout,
        ));

        let token_verifier: Arc<dyn TokenVerifier> = match &config.jwt_secret {
            Some(secret) => {
                info!("Bearer tokens verified locally with the shared secret");
                Arc::new(JwtVerifier::new(secret))
            }
            None => {
                info!(auth_service = %config.auth_service_url, "Bearer tokens verified by the Auth Service");
                auth_client.clone()
            }
        };

        let failure_guard = config
            .auth_failure_guard_enabled()
            .then(|| Arc::new(AuthFailureGuard::new(config.auth_failure_limit_per_minute)));

        let auth = AuthFilterChain::new(
            BearerFilter::new(token_verifier),
            ApiKeyFilter::new(auth_client),
            failure_guard,
        );

        Self::new(routing, auth, http, GatewaySettings::from_config(config))
    }

    pub fn routing(&self) -> &Arc<SharedRouting> {
        &self.routing
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Re-read the routes file and apply its limit sections.
    ///
    /// Breaker thresholds change in place; open breakers stay open and
    /// recorded failures are kept. A rejected file changes nothing.
    pub fn reload_routes(&self) -> Result<ReloadSummary, RoutingError> {
        let summary = self.routing.reload()?;
        let breaker = self.routing.snapshot().limits.breaker(&self.settings.breaker);
        self.breakers.reconfigure(breaker);
        Ok(summary)
    }

    pub fn auth_failure_guard(&self) -> Option<&Arc<AuthFailureGuard>> {
        self.auth.failure_guard()
    }

    /// Run one request through the pipeline.
    ///
    /// `client_ip` must already be resolved against the trusted proxy list.
    pub async fn dispatch(&self, request: Request<Body>, client_ip: &str) -> Response {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        // One snapshot for the whole request, so a concurrent reload cannot
        // split route and fallback lookups.
        let snapshot = self.routing.snapshot();

        let Some(matched) = snapshot.table.find(&path) else {
            let err = GatewayError::NoRouteMatched(path.clone());
            debug!(method = %method, path = %path, client_ip = %client_ip, "No route matched");
            metrics::record_request(
                "unmatched",
                err.kind(),
                StatusCode::NOT_FOUND.as_u16(),
                started.elapsed().as_secs_f64(),
            );
            return err.into_response();
        };

        let mut trace = RequestTrace::default();
        let result = self
            .process(&snapshot, &matched, request, client_ip, &mut trace)
            .await;

        let route = &matched.route;
        let (response, outcome) = match result {
            Ok(response) => (response, "forwarded"),
            Err(err) => {
                let outcome = err.kind();
                (self.error_response(&snapshot, &matched, err), outcome)
            }
        };

        let status = response.status();
        let latency = started.elapsed();
        let identity = trace.identity.as_deref().unwrap_or("unauthenticated");
        let latency_ms = latency.as_secs_f64() * 1000.0;

        if status.is_server_error() {
            warn!(
                route = %route.id,
                service = %route.service,
                identity = %identity,
                method = %method,
                path = %path,
                status = status.as_u16(),
                outcome,
                attempts = trace.attempts,
                latency_ms,
                "Request completed"
            );
        } else {
            info!(
                route = %route.id,
                service = %route.service,
                identity = %identity,
                method = %method,
                path = %path,
                status = status.as_u16(),
                outcome,
                attempts = trace.attempts,
                latency_ms,
                "Request completed"
            );
        }
        metrics::record_request(&route.id, outcome, status.as_u16(), latency.as_secs_f64());

        response
    }

    async fn process(
        &self,
        snapshot: &RoutingSnapshot,
        matched: &RouteMatch,
        request: Request<Body>,
        client_ip: &str,
        trace: &mut RequestTrace,
    ) -> GatewayResult<Response> {
        let route = &matched.route;

        let identity = self
            .auth
            .authenticate(route.auth, request.headers(), client_ip)
            .await?;
        trace.identity = Some(identity.redacted());

        let base_url = snapshot.resolve_backend(&route.service).ok_or_else(|| {
            GatewayError::Config(format!("no backend URL for service '{}'", route.service))
        })?;

        // Requests that can never be forwarded must not spend quota.
        let (parts, body) = request.into_parts();
        let max_body = self.settings.max_body_size;
        if parts
            .headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .is_some_and(|len| len > max_body)
        {
            return Err(GatewayError::PayloadTooLarge(max_body));
        }

        let quota = self.quota_for(snapshot, &identity, route.rate_limit_per_minute);
        let admission = self.limiter.admit(&identity.rate_limit_key(), quota);
        if !admission.allowed {
            metrics::record_rate_limit_rejection(&route.id);
            return Err(GatewayError::RateLimited {
                retry_after_secs: admission.retry_after_secs(),
                limit: admission.limit,
            });
        }

        let body = axum::body::to_bytes(body, max_body).await.map_err(|e| {
            debug!(error = %e, "Failed to buffer request body");
            GatewayError::PayloadTooLarge(max_body)
        })?;

        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.as_str().to_string());
        let deadline = parts.extensions.get::<ClientDeadline>().map(|d| d.0);
        let trusted_hop = parts.extensions.get::<TrustedHop>().map(|hop| hop.0);

        let forward = ForwardRequest {
            service: route.service.clone(),
            url: format!(
                "{base_url}{}",
                matched.upstream_path_and_query(parts.uri.path(), parts.uri.query())
            ),
            headers: upstream_headers(
                &parts.headers,
                identity.user_id(),
                request_id.as_deref(),
                client_ip,
                trusted_hop,
            ),
            retryable: RetryPolicy::allows(&parts.method, route.idempotent),
            method: parts.method,
            body,
            deadline,
        };

        // Spawned so a client disconnect cannot abandon a call mid-flight: the
        // breaker still records the outcome, and the result is discarded.
        let proxy = self.proxy.clone();
        let breaker = self.breakers.get(&route.service);
        let upstream = tokio::spawn(async move { proxy.forward(breaker, forward).await })
            .await
            .map_err(|e| GatewayError::Internal(format!("backend task failed: {e}")))??;
        trace.attempts = upstream.attempts;

        let mut response = Response::new(Body::from(upstream.body));
        *response.status_mut() = upstream.status;
        *response.headers_mut() = upstream.headers;
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(admission.limit));
        headers.insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from(admission.remaining),
        );
        Ok(response)
    }

    /// API key limit, then route override, then the routes file default,
    /// then the environment default.
    fn quota_for(
        &self,
        snapshot: &RoutingSnapshot,
        identity: &Identity,
        route_limit: Option<u32>,
    ) -> Quota {
        identity
            .quota_override()
            .or(route_limit)
            .map(Quota::per_minute)
            .unwrap_or_else(|| snapshot.limits.quota(self.settings.default_quota))
    }

    fn error_response(
        &self,
        snapshot: &RoutingSnapshot,
        matched: &RouteMatch,
        err: GatewayError,
    ) -> Response {
        match err {
            GatewayError::BreakerOpen(_) | GatewayError::BackendError { .. } => {
                debug!(route = %matched.route.id, error = %err, "Serving fallback");
                snapshot.fallbacks.resolve(&matched.route.fallback_id).render()
            }
            GatewayError::AuthServiceUnavailable(_) => {
                let status = self.settings.auth_unavailable_policy.status();
                err.into_response_as(status)
            }
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                error!(route = %matched.route.id, error = %err, "Pipeline failure");
                err.into_response()
            }
            other => other.into_response(),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("routes", &self.routing.snapshot().table.len())
            .field("buckets", &self.limiter.len())
            .field("breakers", &self.breakers.len())
            .finish()
    }
}
