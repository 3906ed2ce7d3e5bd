//! End-to-end tests for the gateway pipeline.
//!
//! Each test starts three in-process servers on ephemeral ports:
//!
//! - a stub Auth Service (`verify-token` and `api-keys/validate`)
//! - a stub backend that echoes `X-Auth-User-Id` and the forwarded URI
//! - the gateway itself, wired exactly as `main` wires it
//!
//! No external services are required.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use edge_gateway::{AppState, Config, build_router};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::net::TcpListener;

const VALID_TOKEN: &str = "valid-token";
const EXPIRED_TOKEN: &str = "expired-token";
const GOOD_KEY: &str = "good-key";
const ADMIN_TOKEN: &str = "admin-secret";

/// Find a port nothing is listening on.
fn find_unused_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// =============================================================================
// Stub Auth Service
// =============================================================================

#[derive(Clone, Default)]
struct AuthCalls {
    verify: Arc<AtomicUsize>,
    validate: Arc<AtomicUsize>,
}

impl AuthCalls {
    fn total(&self) -> usize {
        self.verify.load(Ordering::SeqCst) + self.validate.load(Ordering::SeqCst)
    }
}

async fn verify_token(State(calls): State<AuthCalls>, Json(body): Json<Value>) -> Json<Value> {
    calls.verify.fetch_add(1, Ordering::SeqCst);
    let now = chrono::Utc::now().timestamp();
    match body["token"].as_str() {
        Some(VALID_TOKEN) => Json(json!({
            "valid": true,
            "subject": "user-42",
            "expiresAt": now + 3600,
            "claims": {"role": "customer"}
        })),
        Some(EXPIRED_TOKEN) => Json(json!({
            "valid": true,
            "subject": "user-42",
            "expiresAt": now - 60
        })),
        _ => Json(json!({"valid": false})),
    }
}

async fn validate_key(
    State(calls): State<AuthCalls>,
    Path(key): Path<String>,
) -> (StatusCode, Json<Value>) {
    calls.validate.fetch_add(1, Ordering::SeqCst);
    if key == GOOD_KEY {
        (
            StatusCode::OK,
            Json(json!({"valid": true, "ownerId": "owner-7", "keyId": 11})),
        )
    } else {
        (StatusCode::NOT_FOUND, Json(json!(false)))
    }
}

async fn start_auth_service(calls: AuthCalls) -> String {
    serve(
        Router::new()
            .route("/api/v1/auth/verify-token", post(verify_token))
            .route("/api/v1/api-keys/validate/{key}", get(validate_key))
            .with_state(calls),
    )
    .await
}

// =============================================================================
// Stub Backend
// =============================================================================

async fn echo(headers: HeaderMap, uri: Uri) -> String {
    let user = headers
        .get("x-auth-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    format!("{user} {uri}")
}

async fn start_backend() -> String {
    serve(Router::new().fallback(echo)).await
}

// =============================================================================
// Fixture
// =============================================================================

struct FixtureOptions {
    quota: u32,
    customer_backend_up: bool,
    auth_service_up: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            quota: 100,
            customer_backend_up: true,
            auth_service_up: true,
        }
    }
}

/// Test fixture that owns the stub services and the gateway server.
struct TestFixture {
    base_url: String,
    client: Client,
    state: AppState,
    auth_calls: AuthCalls,
    routes_path: PathBuf,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_options(FixtureOptions::default()).await
    }

    async fn with_options(options: FixtureOptions) -> Self {
        let auth_calls = AuthCalls::default();
        let auth_url = if options.auth_service_up {
            start_auth_service(auth_calls.clone()).await
        } else {
            format!("http://127.0.0.1:{}", find_unused_port())
        };

        let backend_url = start_backend().await;
        let customer_url = if options.customer_backend_up {
            backend_url.clone()
        } else {
            format!("http://127.0.0.1:{}", find_unused_port())
        };

        let routes_path = std::env::temp_dir().join(format!(
            "edge-gateway-pipeline-{}.yaml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&routes_path, routes_yaml(&backend_url, &customer_url)).unwrap();

        let config = Config {
            routes_config_path: routes_path.display().to_string(),
            auth_service_url: auth_url,
            auth_timeout: Duration::from_millis(500),
            auth_failure_limit_per_minute: 0,
            upstream_timeout: Duration::from_secs(2),
            retry_max_attempts: 1,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            rate_limit_per_period: options.quota,
            rate_limit_period: Duration::from_secs(60),
            circuit_breaker_failure_threshold: 2,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            metrics_port: 0,
            ..Config::default()
        };

        let state = AppState::from_config(config).expect("Failed to build app state");
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            auth_calls,
            routes_path,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_customer(&self, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url("/api/v1/customers/42"));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    async fn teardown(self) {
        self.state.shutdown().await;
        let _ = std::fs::remove_file(&self.routes_path);
    }
}

fn routes_yaml(backend_url: &str, customer_url: &str) -> String {
    format!(
        r"backends:
  auth-service: {backend_url}
  customer-service: {customer_url}
  chatbot-service: {backend_url}
routes:
  - id: auth-service
    path: /api/v1/auth/**
    service: auth-service
    auth: NONE
    fallback: auth
  - id: customer-service
    path: /api/v1/customers/**
    service: customer-service
    auth: BEARER
    fallback: customer
  - id: chatbot-service
    path: /api/v1/chatbot/**
    service: chatbot-service
    auth: API_KEY
    idempotent: true
    rate_limit_per_minute: 1
    fallback: chatbot
fallbacks:
  auth:
    message: Auth Service is currently unavailable
  customer:
    message: Customer Service is currently unavailable
  chatbot:
    message: Chatbot Service is currently unavailable
"
    )
}

// =============================================================================
// Health & Admin
// =============================================================================

#[tokio::test]
async fn test_health_and_readiness() {
    let fixture = TestFixture::new().await;

    let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["routes"], 3);

    let response = fixture.client.get(fixture.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_admin_reload_requires_token() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/admin/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fixture
        .client
        .post(fixture.url("/admin/reload"))
        .header("x-admin-token", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fixture
        .client
        .post(fixture.url("/admin/reload"))
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "reloaded");
    assert_eq!(body["routes"], 3);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_rejected_reload_keeps_serving() {
    let fixture = TestFixture::new().await;
    std::fs::write(&fixture.routes_path, "routes: [").unwrap();

    let response = fixture
        .client
        .post(fixture.url("/admin/reload"))
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = fixture.get_customer(Some(VALID_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::OK);

    fixture.teardown().await;
}

// =============================================================================
// Pipeline
// =============================================================================

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/api/v2/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(fixture.auth_calls.total(), 0);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_customers_require_bearer_token() {
    let fixture = TestFixture::new().await;

    let response = fixture.get_customer(None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 401);

    let response = fixture.get_customer(Some("forged")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fixture.get_customer(Some(EXPIRED_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Nothing was admitted for a failed credential.
    assert!(fixture.state.gateway.limiter().is_empty());

    fixture.teardown().await;
}

#[tokio::test]
async fn test_customers_forwarded_with_identity() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/api/v1/customers/42?expand=orders"))
        .bearer_auth(VALID_TOKEN)
        .header("x-request-id", "trace-abc")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-abc");
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
    assert_eq!(response.text().await.unwrap(), "user-42 /api/v1/customers/42?expand=orders");

    fixture.teardown().await;
}

#[tokio::test]
async fn test_quota_exhausted_returns_429() {
    let fixture = TestFixture::with_options(FixtureOptions {
        quota: 2,
        ..FixtureOptions::default()
    })
    .await;

    for _ in 0..2 {
        let response = fixture.get_customer(Some(VALID_TOKEN)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = fixture.get_customer(Some(VALID_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

    fixture.teardown().await;
}

#[tokio::test]
async fn test_open_route_keyed_by_peer_not_forwarded_header() {
    let fixture = TestFixture::with_options(FixtureOptions {
        quota: 2,
        ..FixtureOptions::default()
    })
    .await;

    // The peer is not a trusted proxy, so a rotating X-Forwarded-For buys nothing.
    let mut statuses = Vec::new();
    for i in 0..3 {
        let response = fixture
            .client
            .post(fixture.url("/api/v1/auth/login"))
            .header("x-forwarded-for", format!("203.0.113.{i}"))
            .body("{}")
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
    assert_eq!(fixture.auth_calls.total(), 0);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_invalid_api_keys_do_not_consume_quota() {
    let fixture = TestFixture::new().await;

    for _ in 0..3 {
        let response = fixture
            .client
            .post(fixture.url("/api/v1/chatbot/chat"))
            .header("x-api-key", "stolen-key")
            .body("hello")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    assert!(fixture.state.gateway.limiter().is_empty());

    let response = fixture
        .client
        .post(fixture.url("/api/v1/chatbot/chat"))
        .header("x-api-key", GOOD_KEY)
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "owner-7 /api/v1/chatbot/chat");

    // The route allows one request per minute for this key.
    let response = fixture
        .client
        .post(fixture.url("/api/v1/chatbot/chat"))
        .header("x-api-key", GOOD_KEY)
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_auth_service_down_fails_closed() {
    let fixture = TestFixture::with_options(FixtureOptions {
        auth_service_up: false,
        ..FixtureOptions::default()
    })
    .await;

    let response = fixture.get_customer(Some(VALID_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    fixture.teardown().await;
}

#[tokio::test]
async fn test_unreachable_backend_opens_breaker_and_serves_fallback() {
    let fixture = TestFixture::with_options(FixtureOptions {
        customer_backend_up: false,
        ..FixtureOptions::default()
    })
    .await;

    for _ in 0..3 {
        let response = fixture.get_customer(Some(VALID_TOKEN)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["message"], "Customer Service is currently unavailable");
        assert_eq!(body["status"], 503);
    }

    let response = fixture
        .client
        .get(fixture.url("/admin/breakers"))
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let breaker = body["breakers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["service"] == "customer-service")
        .unwrap();
    assert_eq!(breaker["state"], "open");
    assert!(breaker["requests_rejected"].as_u64().unwrap() >= 1);

    // Other services are unaffected.
    let response = fixture
        .client
        .post(fixture.url("/api/v1/auth/login"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    fixture.teardown().await;
}
