//! Application router with the middleware stack.
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← span per request
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id accepted or generated, recorded on the span
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Client deadline  │ ← X-Request-Timeout → ClientDeadline
//! └────────┬─────────┘
//!          ▼
//!   /health, /ready, /admin/*   or   fallback → gateway pipeline
//! ```

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{field, info, info_span};

use crate::handlers;
use crate::middleware::{RequestIdLayer, extract_client_deadline};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// Every path not owned by the gateway itself falls through to the proxy
/// handler and is matched against the route table.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    if config.admin_enabled() {
        info!("Admin endpoints enabled");
    } else {
        info!("Admin endpoints disabled (no ADMIN_TOKEN set)");
    }

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/admin/reload", post(handlers::reload_routes))
        .route("/admin/breakers", get(handlers::list_breakers))
        .fallback(handlers::proxy)
        // Applied bottom to top: the last layer sees the request first.
        .layer(axum::middleware::from_fn(extract_client_deadline))
        .layer(build_cors_layer(&config.cors_allowed_origins))
        .layer(RequestIdLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            info_span!(
                "http",
                method = %request.method(),
                path = %request.uri().path(),
                request_id = field::Empty,
            )
        }))
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin; otherwise only the listed origins are allowed.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "not a valid origin\n".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_gateway_endpoints_and_fallthrough() {
        let path = std::env::temp_dir().join(format!("edge-gateway-routes-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "backends:\n  svc: http://127.0.0.1:9\nroutes:\n  - id: svc\n    path: /svc/**\n    service: svc\n    auth: BEARER\n    fallback: svc\nfallbacks:\n  svc:\n    message: Svc is currently unavailable\n",
        )
        .unwrap();
        let config = Config {
            routes_config_path: path.display().to_string(),
            metrics_port: 0,
            ..Config::default()
        };
        let state = AppState::from_config(config).unwrap();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        // Admin is disabled without a token and looks like any unknown path.
        let response = app
            .clone()
            .oneshot(Request::post("/admin/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::get("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/svc/items").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        state.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }
}
