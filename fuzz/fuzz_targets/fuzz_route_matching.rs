//! Fuzz testing for route matching.
//!
//! Request paths come straight from the network, so pattern capture, dot
//! segment detection and table lookup must never panic on any input.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_route_matching
//! cargo +nightly fuzz run fuzz_route_matching -- -max_total_time=60
//! ```
//!
//! # Input Layout
//!
//! The first line is treated as a route pattern (and rewrite template), the
//! rest as the request path.

#![no_main]

use std::sync::OnceLock;

use edge_gateway::routing::{PathPattern, RewriteRule, RoutingSnapshot, has_dot_segment};
use libfuzzer_sys::fuzz_target;

fn default_snapshot() -> Option<&'static RoutingSnapshot> {
    static SNAPSHOT: OnceLock<Option<RoutingSnapshot>> = OnceLock::new();
    SNAPSHOT
        .get_or_init(|| RoutingSnapshot::from_yaml_str(include_str!("../../config/routes.yaml")).ok())
        .as_ref()
}

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (pattern, path) = input.split_once('\n').unwrap_or((input, input));

    let _ = has_dot_segment(path);

    if let Ok(parsed) = PathPattern::parse(pattern)
        && let Some(capture) = parsed.capture(path)
    {
        assert!(path.ends_with(capture));
        if let Ok(rule) = RewriteRule::from_template(Some(pattern)) {
            let _ = rule.apply(path, capture);
        }
    }

    if let Some(snapshot) = default_snapshot()
        && let Some(found) = snapshot.table.find(path)
    {
        assert!(!has_dot_segment(path));
        let _ = found.upstream_path_and_query(path, None);
    }
});
