//! Backend HTTP forwarding with bounded retries.
//!
//! Each attempt passes through the service's circuit breaker and carries its
//! own timeout. Retries use exponential backoff with ±20% jitter:
//!
//! ```text
//! delay(n) = min(base * 2^(n-1), max) ± 20%     (never below MIN_RETRY_DELAY_MS)
//! ```
//!
//! | Attempt outcome         | Breaker  | Retried? |
//! |-------------------------|----------|----------|
//! | 2xx / 3xx / 4xx         | success  | no       |
//! | 5xx                     | failure  | yes      |
//! | transport error         | failure  | yes      |
//! | timeout                 | failure  | yes      |
//! | short-circuited         | -        | stops    |

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::error::GatewayError;
use crate::metrics;

/// Jitter percentage for exponential backoff (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Floor for any retry delay.
const MIN_RETRY_DELAY_MS: u64 = 10;

/// Hop-by-hop headers (RFC 9110 §7.6.1) never forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Generate a random jitter value between 0.0 and 1.0.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), jitter included.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(1 << exponent).min(max_ms);

        let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
        let final_ms = (delay_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;
        Duration::from_millis(final_ms)
    }

    /// GET, HEAD and PUT are retried by default; other methods only on
    /// routes explicitly marked idempotent.
    pub fn allows(method: &Method, route_idempotent: bool) -> bool {
        route_idempotent || matches!(*method, Method::GET | Method::HEAD | Method::PUT)
    }
}

/// A fully buffered request ready to forward.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub service: String,
    pub method: Method,
    /// Absolute upstream URL including query string.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub retryable: bool,
    /// Overall deadline requested by the client, if any.
    pub deadline: Option<Duration>,
}

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub attempts: u32,
}

enum AttemptError {
    Timeout,
    Transport(String),
    Status(StatusCode),
}

/// Forwards requests to backends.
#[derive(Debug, Clone)]
pub struct BackendProxy {
    http: reqwest::Client,
    policy: RetryPolicy,
    upstream_timeout: Duration,
}

impl BackendProxy {
    pub fn new(http: reqwest::Client, policy: RetryPolicy, upstream_timeout: Duration) -> Self {
        Self {
            http,
            policy,
            upstream_timeout,
        }
    }

    /// Forward `request`, retrying per policy.
    ///
    /// # Errors
    ///
    /// - `BreakerOpen` if any attempt is short-circuited
    /// - `UpstreamTimeout` if the final attempt timed out
    /// - `BackendError` if the final attempt failed otherwise
    pub async fn forward(
        &self,
        breaker: Arc<CircuitBreaker>,
        request: ForwardRequest,
    ) -> Result<UpstreamResponse, GatewayError> {
        let started = Instant::now();
        let max_attempts = if request.retryable {
            self.policy.max_retries.saturating_add(1)
        } else {
            1
        };

        let mut last_error = AttemptError::Transport("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for(attempt - 1);
                if request
                    .deadline
                    .is_some_and(|deadline| started.elapsed() + delay >= deadline)
                {
                    debug!(service = %request.service, "Client deadline leaves no room for another retry");
                    break;
                }
                metrics::record_upstream_retry(&request.service);
                debug!(service = %request.service, attempt, delay = ?delay, "Retrying backend call");
                tokio::time::sleep(delay).await;
            }

            let Some(timeout) = self.attempt_timeout(started, request.deadline) else {
                last_error = AttemptError::Timeout;
                break;
            };

            let Ok(permit) = breaker.try_acquire() else {
                return Err(GatewayError::BreakerOpen(request.service.clone()));
            };

            match tokio::time::timeout(timeout, self.send(&request)).await {
                Ok(Ok(response)) if response.status.is_server_error() => {
                    permit.record_failure();
                    warn!(service = %request.service, attempt, status = %response.status, "Backend returned server error");
                    last_error = AttemptError::Status(response.status);
                }
                Ok(Ok(mut response)) => {
                    permit.record_success();
                    response.attempts = attempt;
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    permit.record_failure();
                    warn!(service = %request.service, attempt, error = %e, "Backend call failed");
                    last_error = if e.is_timeout() {
                        AttemptError::Timeout
                    } else {
                        AttemptError::Transport(e.to_string())
                    };
                }
                Err(_) => {
                    permit.record_failure();
                    warn!(service = %request.service, attempt, timeout = ?timeout, "Backend call timed out");
                    last_error = AttemptError::Timeout;
                }
            }
        }

        Err(match last_error {
            AttemptError::Timeout => GatewayError::UpstreamTimeout(request.service),
            AttemptError::Transport(detail) => GatewayError::BackendError {
                service: request.service,
                detail,
            },
            AttemptError::Status(status) => GatewayError::BackendError {
                service: request.service,
                detail: format!("status {status}"),
            },
        })
    }

    fn attempt_timeout(&self, started: Instant, deadline: Option<Duration>) -> Option<Duration> {
        match deadline {
            None => Some(self.upstream_timeout),
            Some(deadline) => {
                let remaining = deadline.checked_sub(started.elapsed())?;
                (!remaining.is_zero()).then(|| remaining.min(self.upstream_timeout))
            }
        }
    }

    async fn send(&self, request: &ForwardRequest) -> Result<UpstreamResponse, reqwest::Error> {
        let response = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            attempts: 0,
        })
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Build the header set sent upstream.
///
/// Client-supplied `X-Auth-User-Id` is always discarded; the gateway sets it
/// only from a verified identity.
///
/// An inbound `X-Forwarded-For` chain is extended with the proxy address only
/// when the request came through a trusted proxy (`trusted_hop`). Otherwise
/// the chain is replaced by `client_ip`, so backends never see client-forged
/// entries.
pub fn upstream_headers(
    inbound: &HeaderMap,
    user_id: Option<&str>,
    request_id: Option<&str>,
    client_ip: &str,
    trusted_hop: Option<IpAddr>,
) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(crate::auth::AUTH_USER_ID_HEADER);

    if let Some(value) = user_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(crate::auth::AUTH_USER_ID_HEADER, value);
    }
    if let Some(value) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(crate::middleware::request_id::REQUEST_ID_HEADER, value);
    }

    let existing = headers
        .get(crate::middleware::ip::X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let forwarded_for = match (trusted_hop, existing) {
        (Some(hop), Some(existing)) => format!("{existing}, {hop}"),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(crate::middleware::ip::X_FORWARDED_FOR, value);
    }

    headers
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::routing::any;
    use tokio::net::TcpListener;

    use super::*;
    use crate::gateway::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };

        for _ in 0..20 {
            let first = policy.delay_for(1).as_millis();
            assert!((80..=120).contains(&first), "{first}");
            let capped = policy.delay_for(5).as_millis();
            assert!((320..=480).contains(&capped), "{capped}");
        }
    }

    #[test]
    fn test_backoff_floor() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(MIN_RETRY_DELAY_MS));
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(RetryPolicy::allows(&Method::GET, false));
        assert!(RetryPolicy::allows(&Method::PUT, false));
        assert!(!RetryPolicy::allows(&Method::POST, false));
        assert!(!RetryPolicy::allows(&Method::DELETE, false));
        assert!(RetryPolicy::allows(&Method::POST, true));
    }

    #[test]
    fn test_upstream_headers_strip_and_inject() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret-hop"));
        inbound.insert("x-secret-hop", HeaderValue::from_static("1"));
        inbound.insert("x-auth-user-id", HeaderValue::from_static("spoofed"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let hop: IpAddr = "10.0.0.2".parse().unwrap();
        let headers = upstream_headers(
            &inbound,
            Some("user-42"),
            Some("req-1"),
            "203.0.113.9",
            Some(hop),
        );

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-secret-hop").is_none());
        assert_eq!(headers.get("x-auth-user-id").unwrap(), "user-42");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9, 10.0.0.2");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_anonymous_drops_spoofed_user_id() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-auth-user-id", HeaderValue::from_static("admin"));
        let headers = upstream_headers(&inbound, None, None, "10.0.0.2", None);
        assert!(headers.get("x-auth-user-id").is_none());
    }

    #[test]
    fn test_untrusted_forwarded_for_is_replaced() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));

        let headers = upstream_headers(&inbound, None, None, "203.0.113.7", None);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_trusted_hop_without_chain_uses_client_ip() {
        let hop: IpAddr = "10.0.0.2".parse().unwrap();
        let headers = upstream_headers(&HeaderMap::new(), None, None, "10.0.0.2", Some(hop));
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.2");
    }

    // =========================================================================
    // Forwarding against a scripted backend
    // =========================================================================

    /// Returns the status at index `hits` (last one repeats).
    async fn scripted_backend(script: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let state = (Arc::new(script), hits.clone());
        let app = Router::new()
            .route(
                "/{*rest}",
                any(
                    |State((script, hits)): State<(Arc<Vec<u16>>, Arc<AtomicU32>)>| async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) as usize;
                        let code = script.get(n).or(script.last()).copied().unwrap_or(200);
                        (StatusCode::from_u16(code).unwrap(), format!("attempt {n}"))
                    },
                ),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), hits)
    }

    fn proxy() -> BackendProxy {
        BackendProxy::new(
            reqwest::Client::new(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            Duration::from_secs(2),
        )
    }

    fn request(base: &str, method: Method, retryable: bool) -> ForwardRequest {
        ForwardRequest {
            service: "svc".to_string(),
            method,
            url: format!("{base}/customers/42"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            retryable,
            deadline: None,
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::new(threshold, Duration::from_secs(60), Duration::from_secs(30)),
        ))
    }

    #[tokio::test]
    async fn test_retries_5xx_then_succeeds() {
        let (base, hits) = scripted_backend(vec![503, 502, 200]).await;
        let response = proxy()
            .forward(breaker(10), request(&base, Method::GET, true))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_4xx_not_retried_and_counts_as_success() {
        let (base, hits) = scripted_backend(vec![404]).await;
        let cb = breaker(1);
        let response = proxy()
            .forward(cb.clone(), request(&base, Method::GET, true))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_retryable_single_attempt() {
        let (base, hits) = scripted_backend(vec![500]).await;
        let err = proxy()
            .forward(breaker(10), request(&base, Method::POST, false))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BackendError { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_ends_retry_loop() {
        let (base, hits) = scripted_backend(vec![500]).await;
        let err = proxy()
            .forward(breaker(2), request(&base, Method::GET, true))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BreakerOpen(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_final_timeout_is_upstream_timeout() {
        let app = Router::new().route(
            "/{*rest}",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let proxy = BackendProxy::new(
            reqwest::Client::new(),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Duration::from_millis(100),
        );
        let err = proxy
            .forward(breaker(10), request(&format!("http://{addr}"), Method::GET, true))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UpstreamTimeout(_)));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
