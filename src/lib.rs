//! # Edge Gateway
//!
//! The HTTP edge of a multi-service backend. Every inbound request is:
//!
//! 1. matched against an ordered route table (longest static prefix wins)
//! 2. authenticated by the route's single scheme: none, bearer token or API key
//! 3. admitted by a per-identity fixed-window rate limiter
//! 4. forwarded through the backend's circuit breaker, with bounded retries
//!    and a static fallback response when the backend is unavailable
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Trace → Request ID → CORS → Client deadline)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, admin, proxy fallback)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Gateway::dispatch                                          │
//! │    RouteTable → AuthFilterChain → RateLimiter               │
//! │    → CircuitBreaker + BackendProxy → FallbackResponse       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Auth Service (verify-token, validate API key) / backends   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edge_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::from_config(config)?;
//!     let app = build_router(state);
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod routing;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewaySettings};
pub use routes::build_router;
pub use routing::{RoutingSnapshot, SharedRouting};
pub use state::AppState;
