//! Shared application state for Axum handlers.
//!
//! `AppState` owns the [`Gateway`] pipeline plus the background tasks that
//! keep it healthy:
//!
//! - **Sweeper**: evicts idle rate limiter buckets and expired auth failure
//!   blocks every `RATE_LIMIT_SWEEP_INTERVAL_SECS`
//! - **Reloader** (unix): re-reads the route table on `SIGHUP`
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;
use crate::metrics;
use crate::middleware::TrustedProxies;
use crate::routing::{ReloadSummary, RoutingError, SharedRouting};

/// Idle keep-alive for pooled backend connections.
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// Shared application state, cloned into every handler.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::from_config(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub config: Arc<Config>,
    pub trusted_proxies: Arc<TrustedProxies>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Load the route table named by the configuration and wire the gateway.
    ///
    /// Must be called inside a tokio runtime (background tasks are spawned).
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the route table is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: Config) -> GatewayResult<Self> {
        let routing = Arc::new(SharedRouting::from_file(&config.routes_config_path)?);

        let http = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        let gateway = Gateway::from_config(&config, routing, http);
        Ok(Self::new(config, gateway))
    }

    /// Wrap an already wired gateway and start the background tasks.
    pub fn new(config: Config, gateway: Gateway) -> Self {
        let trusted_proxies = Arc::new(TrustedProxies::new(&config.trusted_proxies));
        if trusted_proxies.is_enabled() {
            info!(
                ranges = config.trusted_proxies.len(),
                "Forwarding headers honoured from trusted proxies"
            );
        }

        let state = Self {
            gateway,
            config: Arc::new(config),
            trusted_proxies,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweeper_task();
        #[cfg(unix)]
        state.spawn_sighup_reloader();

        state
    }

    /// Re-read the route table and its limit sections. On failure the active
    /// table stays in place.
    ///
    /// # Errors
    ///
    /// Returns the `RoutingError` that rejected the new table.
    pub fn reload_routes(&self) -> Result<ReloadSummary, RoutingError> {
        reload(&self.gateway)
    }

    /// Spawn the idle bucket / blocked IP sweeper.
    fn spawn_sweeper_task(&self) {
        let limiter = self.gateway.limiter().clone();
        let guard = self.gateway.auth_failure_guard().cloned();
        let every = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweeper task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        if let Some(guard) = &guard {
                            guard.sweep();
                        }
                        metrics::set_rate_limiter_buckets(limiter.len());
                        trace!(evicted, live = limiter.len(), "Rate limiter sweep complete");
                    }
                }
            }

            debug!("Sweeper task shutting down");
        });
    }

    #[cfg(unix)]
    fn spawn_sighup_reloader(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP, route reload only via /admin/reload");
                return;
            }
        };
        let gateway = self.gateway.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("Received SIGHUP, reloading route table");
                        // Failure is already logged and counted.
                        let _ = reload(&gateway);
                    }
                }
            }

            debug!("SIGHUP reloader shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn reload(gateway: &Gateway) -> Result<ReloadSummary, RoutingError> {
    let result = gateway.reload_routes();
    match &result {
        Ok(_) => metrics::record_route_reload("success"),
        Err(e) => {
            warn!(error = %e, "Route table reload rejected, keeping the active table");
            metrics::record_route_reload("error");
        }
    }
    result
}
