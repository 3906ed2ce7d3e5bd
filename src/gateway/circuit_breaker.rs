//! Per-backend circuit breakers.
//!
//! The circuit breaker prevents request pile-up during backend outages by
//! failing fast when a service is known to be unavailable, and lets a single
//! probe through once the reset timeout has passed.
//!
//! # States
//!
//! ```text
//!   ┌─────────┐  failures ≥ threshold   ┌─────────┐
//!   │ Closed  │ ──────────────────────► │  Open   │ ◄──────┐
//!   └────▲────┘    (rolling window)     └────┬────┘        │
//!        │                                   │ reset       │
//!        │ probe success                     │ timeout     │ probe failure
//!        │                              ┌────▼─────┐       │
//!        └───────────────────────────── │ HalfOpen │ ──────┘
//!                                       │ 1 probe  │
//!                                       └──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let permit = match breaker.try_acquire() {
//!     Ok(permit) => permit,
//!     Err(BreakerRejected) => return fallback.render(),
//! };
//!
//! match call_backend().await {
//!     Ok(resp) if resp.status().is_server_error() => permit.record_failure(),
//!     Ok(_) => permit.record_success(),
//!     Err(_) => permit.record_failure(),
//! }
//! ```
//!
//! Every admitted call holds a [`BreakerPermit`]. A permit dropped without an
//! outcome counts as a failure, so a cancelled half-open probe can never leave
//! the breaker stuck with its probe slot taken.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - exactly one probe request is allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` before opening the circuit.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub window: Duration,
    /// How long to stay open before allowing a half-open probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, window: Duration, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            window,
            reset_timeout,
        }
    }
}

/// Returned when the breaker short-circuits a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejected;

struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    opened_at: Option<Instant>,
    /// Failure timestamps inside the rolling window (Closed only).
    failures: VecDeque<Instant>,
    half_open_probe_in_flight: bool,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            opened_at: None,
            failures: VecDeque::new(),
            half_open_probe_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.window;
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of one breaker, served by `GET /admin/breakers`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub half_open_probe_in_flight: bool,
    pub times_opened: u32,
    pub requests_rejected: u64,
}

/// Thread-safe circuit breaker for one backend service.
///
/// State lives behind a `parking_lot::Mutex` held only for bookkeeping, never
/// across an await, which lets [`BreakerPermit`] settle its outcome in `Drop`.
pub struct CircuitBreaker {
    service: String,
    /// State and the thresholds it is judged against, under one lock.
    state: Mutex<BreakerState>,
    /// Total number of times the circuit has been opened (for metrics).
    times_opened: AtomicU32,
    /// Total number of requests rejected due to open circuit (for metrics).
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            state: Mutex::new(BreakerState::new(config)),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Ask to make one backend call.
    ///
    /// - **Closed**: always admitted
    /// - **Open**: rejected until `opened_at + reset_timeout`, then the caller
    ///   becomes the half-open probe
    /// - **HalfOpen**: rejected while the probe is in flight
    ///
    /// # Errors
    ///
    /// Returns `BreakerRejected` when the call must short-circuit.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerRejected> {
        let mut state = self.state.lock();
        let current = state.state;

        match current {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .is_none_or(|opened_at| opened_at.elapsed() >= state.config.reset_timeout);
                if !expired {
                    drop(state);
                    return Err(self.reject());
                }

                state.state = CircuitState::HalfOpen;
                state.half_open_probe_in_flight = true;
                drop(state);

                metrics::set_circuit_breaker_state(&self.service, CircuitState::HalfOpen);
                info!(service = %self.service, "Circuit breaker transitioning from Open to HalfOpen");
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen => {
                if state.half_open_probe_in_flight {
                    drop(state);
                    return Err(self.reject());
                }
                state.half_open_probe_in_flight = true;
                Ok(self.permit(true))
            }
        }
    }

    fn permit(self: &Arc<Self>, probe: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        }
    }

    fn reject(&self) -> BreakerRejected {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_rejection(&self.service);
        debug!(service = %self.service, "Circuit breaker short-circuited request");
        BreakerRejected
    }

    fn settle(&self, success: bool, probe: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();

        if probe {
            state.half_open_probe_in_flight = false;
            if state.state != CircuitState::HalfOpen {
                // Forced out of HalfOpen while the probe was running.
                return;
            }
            if success {
                state.state = CircuitState::Closed;
                state.opened_at = None;
                state.failures.clear();
                drop(state);
                metrics::set_circuit_breaker_state(&self.service, CircuitState::Closed);
                info!(service = %self.service, "Circuit breaker closed after successful probe");
            } else {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                drop(state);
                self.on_opened();
                warn!(service = %self.service, "Circuit breaker reopened after failed probe");
            }
            return;
        }

        // Outcomes of calls admitted while Closed only count while still Closed.
        if state.state != CircuitState::Closed {
            debug!(
                service = %self.service,
                state = %state.state,
                "Ignoring stale outcome from call admitted before state change"
            );
            return;
        }

        if success {
            state.failures.clear();
            return;
        }

        state.failures.push_back(now);
        state.prune(now);
        let failures = state.failures.len();
        let threshold = state.config.failure_threshold;
        debug!(
            service = %self.service,
            failures,
            threshold,
            "Circuit breaker recorded failure"
        );

        if failures >= threshold as usize {
            let reset_timeout = state.config.reset_timeout;
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            state.failures.clear();
            drop(state);
            self.on_opened();
            warn!(
                service = %self.service,
                failures,
                reset_timeout = ?reset_timeout,
                "Circuit breaker opened due to failures within window"
            );
        }
    }

    fn on_opened(&self) {
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_open(&self.service);
        metrics::set_circuit_breaker_state(&self.service, CircuitState::Open);
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.state.lock().config.clone()
    }

    /// Swap thresholds in place. State, failure history and counters are kept;
    /// the new threshold applies from the next recorded failure and the new
    /// reset timeout to the current open period.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        let mut state = self.state.lock();
        if state.config == config {
            return;
        }
        debug!(service = %self.service, ?config, "Circuit breaker reconfigured");
        state.config = config;
    }

    /// Get the number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Get the number of requests rejected due to open circuit.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        BreakerSnapshot {
            service: self.service.clone(),
            state: state.state,
            failure_count: state.failures.len(),
            half_open_probe_in_flight: state.half_open_probe_in_flight,
            times_opened: self.times_opened(),
            requests_rejected: self.requests_rejected(),
        }
    }

    /// Force the circuit to close (for testing or manual recovery).
    pub fn force_close(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.opened_at = None;
        state.failures.clear();
        drop(state);
        metrics::set_circuit_breaker_state(&self.service, CircuitState::Closed);
        info!(service = %self.service, "Circuit breaker forcibly closed");
    }

    /// Force the circuit to open (for testing or manual intervention).
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.failures.clear();
        drop(state);
        self.on_opened();
        warn!(service = %self.service, "Circuit breaker forcibly opened");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to make one backend call. Settle it with an outcome.
#[must_use = "a permit dropped without an outcome counts as a failure"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(true, self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(false, self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(false, self.probe);
        }
    }
}

/// One breaker per logical backend service, created on first use.
///
/// The registry outlives route table reloads, so breaker state is kept when
/// routes are edited. New thresholds from a reload are pushed into every
/// existing breaker with [`CircuitBreakerRegistry::reconfigure`].
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: RwLock<CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            breakers: DashMap::new(),
        }
    }

    /// Thresholds given to breakers created from now on.
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config.read().clone()
    }

    /// Apply `config` to the registry and every existing breaker.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        {
            let mut current = self.config.write();
            if *current == config {
                return;
            }
            *current = config.clone();
        }
        for entry in &self.breakers {
            entry.value().reconfigure(config.clone());
        }
        info!(
            failure_threshold = config.failure_threshold,
            window = ?config.window,
            reset_timeout = ?config.reset_timeout,
            "Circuit breaker thresholds updated"
        );
    }

    /// Get or atomically create the breaker for `service`.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config())));
        Arc::clone(entry.value())
    }

    /// Snapshots of every known breaker, sorted by service name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
