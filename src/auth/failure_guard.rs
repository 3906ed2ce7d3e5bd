//! Per-IP brute force guard for credential filters.
//!
//! Only failures spend budget. Once an IP's budget is exhausted it is blocked
//! until governor would admit another failure, and blocked requests are
//! answered with 429 before any Auth Service round-trip.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::warn;

/// Type alias for the auth failure rate limiter (per-IP).
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct AuthFailureGuard {
    limiter: AuthFailureLimiter,
    limit_per_minute: u32,
    blocked_until: DashMap<String, Instant>,
}

impl AuthFailureGuard {
    /// Allow `limit_per_minute` failures per IP (clamped to at least one).
    pub fn new(limit_per_minute: u32) -> Self {
        let limit = NonZeroU32::new(limit_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(limit)),
            limit_per_minute: limit.get(),
            blocked_until: DashMap::new(),
        }
    }

    pub fn limit_per_minute(&self) -> u32 {
        self.limit_per_minute
    }

    /// Check whether `client_ip` may attempt authentication.
    ///
    /// # Errors
    ///
    /// Returns the remaining block duration when the IP is blocked.
    pub fn check(&self, client_ip: &str) -> Result<(), Duration> {
        let Some(until) = self.blocked_until.get(client_ip).map(|entry| *entry.value()) else {
            return Ok(());
        };

        let now = Instant::now();
        if now >= until {
            self.blocked_until.remove_if(client_ip, |_, until| now >= *until);
            return Ok(());
        }
        Err(until - now)
    }

    /// Spend one unit of the IP's failure budget, blocking it when exhausted.
    pub fn record_failure(&self, client_ip: &str) {
        let key = client_ip.to_string();
        if let Err(not_until) = self.limiter.check_key(&key) {
            let wait = not_until
                .wait_time_from(DefaultClock::default().now())
                .max(Duration::from_secs(1));
            self.blocked_until.insert(key, Instant::now() + wait);
            warn!(
                client_ip = %client_ip,
                blocked_for_secs = wait.as_secs(),
                "Auth failure budget exhausted, blocking IP"
            );
        }
    }

    /// Drop expired blocks and stale limiter state.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.blocked_until.retain(|_, until| *until > now);
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked_until.len()
    }
}

impl std::fmt::Debug for AuthFailureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFailureGuard")
            .field("limit_per_minute", &self.limit_per_minute)
            .field("blocked", &self.blocked_until.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_within_budget_not_blocked() {
        let guard = AuthFailureGuard::new(3);
        for _ in 0..3 {
            guard.record_failure("10.0.0.1");
        }
        assert!(guard.check("10.0.0.1").is_ok());
    }

    #[test]
    fn test_exhausted_budget_blocks() {
        let guard = AuthFailureGuard::new(2);
        for _ in 0..3 {
            guard.record_failure("10.0.0.1");
        }

        let retry = guard.check("10.0.0.1").unwrap_err();
        assert!(retry >= Duration::from_millis(500));
        assert!(guard.check("10.0.0.2").is_ok());
        assert_eq!(guard.blocked_count(), 1);
    }

    #[test]
    fn test_checks_do_not_spend_budget() {
        let guard = AuthFailureGuard::new(1);
        for _ in 0..50 {
            assert!(guard.check("10.0.0.3").is_ok());
        }
        guard.record_failure("10.0.0.3");
        assert!(guard.check("10.0.0.3").is_ok());
    }

    #[test]
    fn test_zero_limit_clamped() {
        assert_eq!(AuthFailureGuard::new(0).limit_per_minute(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_blocks() {
        let guard = AuthFailureGuard::new(1);
        guard.record_failure("10.0.0.4");
        guard.record_failure("10.0.0.4");
        guard.sweep();
        assert_eq!(guard.blocked_count(), 1);
    }
}
