//! Per-identity fixed-window rate limiter.
//!
//! Each key owns a bucket of `capacity` tokens that is refilled in full at the
//! start of every period. Buckets live in a sharded [`DashMap`], each behind
//! its own `parking_lot::Mutex`, so unrelated keys never contend.
//!
//! # Key Namespacing
//!
//! | Identity  | Key              |
//! |-----------|------------------|
//! | API key   | `key:<api key>`  |
//! | Bearer    | `sub:<subject>`  |
//! | Anonymous | `ip:<client ip>` |
//!
//! # Eviction
//!
//! A background sweeper removes buckets idle for longer than the TTL or their
//! own period, whichever is longer. Rejected requests count as activity, so a
//! caller hammering an exhausted bucket keeps it alive. Buckets currently
//! referenced by an in-flight `admit` (strong count above one) are never
//! evicted. An evicted bucket would therefore have been refilled anyway.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Namespaced rate limit key. API keys are redacted in `Debug`/`Display`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn ip(ip: &str) -> Self {
        Self(format!("ip:{ip}"))
    }

    pub fn subject(subject: &str) -> Self {
        Self(format!("sub:{subject}"))
    }

    pub fn api_key(key: &str) -> Self {
        Self(format!("key:{key}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-safe rendering.
    pub fn redacted(&self) -> String {
        match self.0.strip_prefix("key:") {
            Some(key) => format!("key:{}", redact_secret(key)),
            None => self.0.clone(),
        }
    }
}

impl fmt::Debug for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RateLimitKey").field(&self.redacted()).finish()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Show at most the first four characters of a secret.
pub fn redact_secret(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "****".to_string();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}****")
}

/// Tokens per period for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub capacity: u32,
    pub period: Duration,
}

impl Quota {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self { capacity, period }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window ends (zero when allowed).
    pub retry_after: Duration,
}

impl Admission {
    /// `Retry-After` value in whole seconds, never below one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 || secs == 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    period: Duration,
    tokens: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(quota: Quota, now: Instant) -> Self {
        Self {
            capacity: quota.capacity,
            period: quota.period,
            tokens: quota.capacity,
            window_start: now,
            last_seen: now,
        }
    }

    /// Roll the fixed window forward and apply quota changes.
    fn refresh(&mut self, quota: Quota, now: Instant) {
        if quota.period != self.period && !quota.period.is_zero() {
            self.period = quota.period;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.period {
            // Keep windows aligned to the first request instead of drifting.
            let periods = elapsed.as_nanos() / self.period.as_nanos().max(1);
            let advance = self.period.saturating_mul(u32::try_from(periods).unwrap_or(u32::MAX));
            self.window_start = self
                .window_start
                .checked_add(advance)
                .filter(|start| *start <= now)
                .unwrap_or(now);
            self.tokens = quota.capacity;
        }

        if quota.capacity != self.capacity {
            self.capacity = quota.capacity;
            self.tokens = self.tokens.min(self.capacity);
        }
    }

    fn window_remaining(&self, now: Instant) -> Duration {
        (self.window_start + self.period).saturating_duration_since(now)
    }
}

/// Keyed fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    lock_timeout: Duration,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(lock_timeout: Duration, idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            lock_timeout,
            idle_ttl,
        }
    }

    /// Check and consume one token for `key`.
    ///
    /// Waits at most `lock_timeout` for the bucket lock; on timeout the
    /// request is rejected. A rejection never changes the bucket's tokens.
    pub fn admit(&self, key: &RateLimitKey, quota: Quota) -> Admission {
        let now = Instant::now();
        let bucket = self.bucket_for(key, quota, now);

        let Some(mut bucket) = bucket.try_lock_for(self.lock_timeout) else {
            warn!(key = %key, timeout = ?self.lock_timeout, "Rate limiter lock wait timed out");
            return Admission {
                allowed: false,
                limit: quota.capacity,
                remaining: 0,
                retry_after: Duration::from_secs(1),
            };
        };

        bucket.refresh(quota, now);
        bucket.last_seen = now;

        if bucket.tokens == 0 {
            let retry_after = bucket.window_remaining(now);
            debug!(key = %key, retry_after = ?retry_after, "Rate limit exceeded");
            return Admission {
                allowed: false,
                limit: bucket.capacity,
                remaining: 0,
                retry_after,
            };
        }

        bucket.tokens -= 1;
        Admission {
            allowed: true,
            limit: bucket.capacity,
            remaining: bucket.tokens,
            retry_after: Duration::ZERO,
        }
    }

    /// Atomic get-or-create. The returned `Arc` pins the bucket against eviction.
    fn bucket_for(&self, key: &RateLimitKey, quota: Quota, now: Instant) -> Arc<Mutex<Bucket>> {
        if let Some(existing) = self.buckets.get(key.as_str()) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .buckets
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(quota, now))));
        Arc::clone(entry.value())
    }

    /// Evict idle buckets. Returns how many were removed.
    ///
    /// A bucket must be idle for both the TTL and its own period, so an
    /// override quota with a longer window than the default is never
    /// refilled early by eviction.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            match bucket.try_lock() {
                Some(b) => {
                    now.saturating_duration_since(b.last_seen) <= self.idle_ttl.max(b.period)
                }
                None => true,
            }
        });

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Evicted idle rate limit buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Tokens left for `key` without consuming any (None if no bucket).
    pub fn peek_remaining(&self, key: &RateLimitKey) -> Option<u32> {
        self.buckets
            .get(key.as_str())
            .map(|bucket| bucket.value().lock().tokens)
    }
}
