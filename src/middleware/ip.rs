//! Client IP resolution with trusted proxy validation.
//!
//! The client IP keys anonymous rate limiting and the auth failure guard, so it
//! must not be spoofable. Forwarding headers are honoured **only** when the TCP
//! peer is inside one of the `TRUSTED_PROXIES` ranges:
//!
//! ```text
//!   peer in TRUSTED_PROXIES?
//!        │
//!        ├── yes → X-Forwarded-For (first entry) → X-Real-IP → peer IP
//!        │
//!        └── no  → peer IP (forwarding headers ignored)
//! ```
//!
//! When no peer address is known (e.g. a router driven without
//! `ConnectInfo`) and no trusted forwarding applies, all such requests share
//! the [`UNKNOWN_IP`] key.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// A parsed CIDR range (e.g. `10.0.0.0/8`, `::1/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation; a bare address is an implicit /32 or /128.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

/// Networks whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
}

impl TrustedProxies {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();
        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        // IPv4-mapped IPv6 peers (dual-stack listeners) compare as IPv4.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(*ip, IpAddr::V4),
            IpAddr::V4(_) => *ip,
        };
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}

/// Address of the trusted proxy a request arrived through.
///
/// Inserted as a request extension by the proxy handler; its absence means
/// the inbound forwarding chain must not be passed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedHop(pub IpAddr);

impl TrustedHop {
    /// `Some` when the TCP peer is inside `TRUSTED_PROXIES`.
    pub fn from_peer(peer: Option<SocketAddr>, trusted: &TrustedProxies) -> Option<Self> {
        peer.map(|addr| addr.ip())
            .filter(|ip| trusted.is_trusted(ip))
            .map(Self)
    }
}

/// First non-empty forwarded address, in header priority order.
fn forwarded_ip(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok())
        && let Some(first) = value.split(',').next().map(str::trim)
        && !first.is_empty()
    {
        return Some(first);
    }

    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

/// Resolve the client IP for a request.
///
/// # Returns
///
/// `Cow<'static, str>` - Borrowed for "unknown" (no allocation), owned otherwise.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted: &TrustedProxies,
) -> Cow<'static, str> {
    let peer_ip = peer.map(|addr| addr.ip());

    if let Some(ip) = peer_ip
        && trusted.is_trusted(&ip)
    {
        if let Some(forwarded) = forwarded_ip(headers) {
            return Cow::Owned(forwarded.to_string());
        }
        debug!(peer = %ip, "Trusted proxy sent no forwarding header, using peer address");
    }

    match peer_ip {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
