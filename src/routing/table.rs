use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use super::pattern::{has_dot_segment, PathPattern, RewriteRule};
use super::RoutingError;

/// Authentication scheme required by a route. Exactly one per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthScheme {
    None,
    #[serde(alias = "JWT")]
    Bearer,
    #[serde(alias = "APIKEY")]
    ApiKey,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::None => write!(f, "none"),
            AuthScheme::Bearer => write!(f, "bearer"),
            AuthScheme::ApiKey => write!(f, "api_key"),
        }
    }
}

/// A single immutable route.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: PathPattern,
    pub service: String,
    pub auth: AuthScheme,
    pub rewrite: RewriteRule,
    pub fallback_id: String,
    /// Allows retries for methods that are not idempotent by default (e.g. POST).
    pub idempotent: bool,
    /// Route level quota override, below an API key's own limit.
    pub rate_limit_per_minute: Option<u32>,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub capture: String,
}

impl RouteMatch {
    /// Upstream path after rewrite, with the original query string appended.
    pub fn upstream_path_and_query(&self, path: &str, query: Option<&str>) -> String {
        let mut upstream = self.route.rewrite.apply(path, &self.capture);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            upstream.push('?');
            upstream.push_str(q);
        }
        upstream
    }
}

/// Ordered, read-only route table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Build a table, rejecting duplicate route ids.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::DuplicateRouteId` on the first repeated id.
    pub fn new(routes: Vec<Route>) -> Result<Self, RoutingError> {
        let mut seen = HashSet::with_capacity(routes.len());
        for route in &routes {
            if !seen.insert(route.id.as_str()) {
                return Err(RoutingError::DuplicateRouteId(route.id.clone()));
            }
        }

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    /// Find the route for `path`.
    ///
    /// The longest static prefix wins; on equal length the route declared
    /// first wins. Paths with `.` or `..` segments never match.
    pub fn find(&self, path: &str) -> Option<RouteMatch> {
        if has_dot_segment(path) {
            return None;
        }

        let mut best: Option<(&Arc<Route>, &str)> = None;
        for route in &self.routes {
            let Some(capture) = route.pattern.capture(path) else {
                continue;
            };
            let better = match best {
                Some((current, _)) => {
                    route.pattern.static_len() > current.pattern.static_len()
                }
                None => true,
            };
            if better {
                best = Some((route, capture));
            }
        }

        best.map(|(route, capture)| RouteMatch {
            route: Arc::clone(route),
            capture: capture.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|route| &**route)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn route(id: &str, pattern: &str, auth: AuthScheme) -> Route {
        Route {
            id: id.to_string(),
            pattern: PathPattern::parse(pattern).unwrap(),
            service: format!("{id}-service"),
            auth,
            rewrite: RewriteRule::PassThrough,
            fallback_id: id.to_string(),
            idempotent: false,
            rate_limit_per_minute: None,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new(vec![
            route("api", "/api/**", AuthScheme::None),
            route("customers", "/api/v1/customers/**", AuthScheme::Bearer),
        ])
        .unwrap();

        let m = table.find("/api/v1/customers/42").unwrap();
        assert_eq!(m.route.id, "customers");
        assert_eq!(m.capture, "42");

        let m = table.find("/api/v2/other").unwrap();
        assert_eq!(m.route.id, "api");
    }

    #[test]
    fn test_equal_prefix_declaration_order() {
        let table = RouteTable::new(vec![
            route("first", "/api/v1/chatbot/**", AuthScheme::ApiKey),
            route("second", "/api/v1/chatbot/**", AuthScheme::Bearer),
        ])
        .unwrap();

        assert_eq!(table.find("/api/v1/chatbot/ask").unwrap().route.id, "first");
    }

    #[test]
    fn test_no_match() {
        let table =
            RouteTable::new(vec![route("auth", "/api/v1/auth/**", AuthScheme::None)]).unwrap();
        assert!(table.find("/api/v1/unknown").is_none());
        assert!(table.find("/api/v1/authx").is_none());
    }

    #[test]
    fn test_dot_segments_never_match() {
        let table = RouteTable::new(vec![route("all", "/**", AuthScheme::None)]).unwrap();
        assert!(table.find("/api/v1/auth/../customers").is_none());
        assert!(table.find("/api/v1/auth/login").is_some());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = RouteTable::new(vec![
            route("dup", "/a/**", AuthScheme::None),
            route("dup", "/b/**", AuthScheme::None),
        ]);
        assert!(matches!(result, Err(RoutingError::DuplicateRouteId(id)) if id == "dup"));
    }

    #[test]
    fn test_upstream_path_keeps_query() {
        let mut r = route("customers", "/api/v1/customers/**", AuthScheme::Bearer);
        r.rewrite = RewriteRule::from_template(Some("/customers/{segment}")).unwrap();
        let table = RouteTable::new(vec![r]).unwrap();

        let m = table.find("/api/v1/customers/42").unwrap();
        assert_eq!(
            m.upstream_path_and_query("/api/v1/customers/42", Some("expand=orders")),
            "/customers/42?expand=orders"
        );
        assert_eq!(
            m.upstream_path_and_query("/api/v1/customers/42", None),
            "/customers/42"
        );
    }

    #[test]
    fn test_auth_scheme_deserialize_aliases() {
        let scheme: AuthScheme = serde_yaml::from_str("JWT").unwrap();
        assert_eq!(scheme, AuthScheme::Bearer);
        let scheme: AuthScheme = serde_yaml::from_str("API_KEY").unwrap();
        assert_eq!(scheme, AuthScheme::ApiKey);
        let scheme: AuthScheme = serde_yaml::from_str("NONE").unwrap();
        assert_eq!(scheme, AuthScheme::None);
    }
}
