//! Authentication filter chain.
//!
//! Every route declares exactly one [`AuthScheme`]. The chain dispatches to the
//! matching filter and yields an [`Identity`]:
//!
//! | Scheme    | Filter           | Credential                      |
//! |-----------|------------------|---------------------------------|
//! | `NONE`    | none             | client IP only                  |
//! | `BEARER`  | [`BearerFilter`] | `Authorization: Bearer <token>` |
//! | `API_KEY` | [`ApiKeyFilter`] | `X-API-KEY: <key>`              |
//!
//! Credential filters fail closed: if the Auth Service cannot be reached the
//! request is rejected, never waved through.

pub mod api_key;
pub mod bearer;
pub mod client;
pub mod failure_guard;
pub mod jwt;

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::gateway::rate_limiter::{RateLimitKey, redact_secret};
use crate::routing::AuthScheme;

pub use api_key::{ApiKeyDetails, ApiKeyFilter, ApiKeyValidator};
pub use bearer::{BearerFilter, TokenVerification, TokenVerifier};
pub use client::AuthServiceClient;
pub use failure_guard::AuthFailureGuard;
pub use jwt::JwtVerifier;

/// Header carrying the authenticated principal to backends.
pub const AUTH_USER_ID_HEADER: &str = "x-auth-user-id";

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Error returned by Auth Service capabilities.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Transport failure, timeout or 5xx: the answer is unknown.
    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

/// Who is making the request, as established by the route's filter.
#[derive(Clone, PartialEq)]
pub enum Identity {
    Anonymous {
        client_ip: String,
    },
    Bearer {
        subject: String,
        claims: serde_json::Map<String, serde_json::Value>,
    },
    ApiKey(ApiKeyIdentity),
}

/// Identity established from a validated API key.
#[derive(Clone, PartialEq)]
pub struct ApiKeyIdentity {
    /// Raw key, used as the rate limit key. Never logged in clear.
    pub key: String,
    pub owner_id: Option<String>,
    pub key_id: Option<String>,
    pub scopes: Vec<String>,
    pub per_minute_limit: Option<u32>,
}

impl Identity {
    pub fn scheme(&self) -> AuthScheme {
        match self {
            Identity::Anonymous { .. } => AuthScheme::None,
            Identity::Bearer { .. } => AuthScheme::Bearer,
            Identity::ApiKey(_) => AuthScheme::ApiKey,
        }
    }

    /// Value for `X-Auth-User-Id`: bearer subject or API key owner.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Anonymous { .. } => None,
            Identity::Bearer { subject, .. } => Some(subject),
            Identity::ApiKey(key) => key.owner_id.as_deref(),
        }
    }

    /// Rate limiter key derived from the verified credential only.
    pub fn rate_limit_key(&self) -> RateLimitKey {
        match self {
            Identity::Anonymous { client_ip } => RateLimitKey::ip(client_ip),
            Identity::Bearer { subject, .. } => RateLimitKey::subject(subject),
            Identity::ApiKey(key) => RateLimitKey::api_key(&key.key),
        }
    }

    /// Per-identity quota, which takes precedence over route and global quotas.
    pub fn quota_override(&self) -> Option<u32> {
        match self {
            Identity::ApiKey(key) => key.per_minute_limit,
            _ => None,
        }
    }

    /// Log-safe description of the identity.
    pub fn redacted(&self) -> String {
        match self {
            Identity::Anonymous { client_ip } => format!("anonymous:{client_ip}"),
            Identity::Bearer { subject, .. } => format!("bearer:{subject}"),
            Identity::ApiKey(key) => match &key.owner_id {
                Some(owner) => format!("api_key:{owner}"),
                None => format!("api_key:{}", redact_secret(&key.key)),
            },
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ApiKeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyIdentity")
            .field("key", &redact_secret(&self.key))
            .field("owner_id", &self.owner_id)
            .field("key_id", &self.key_id)
            .field("scopes", &self.scopes)
            .field("per_minute_limit", &self.per_minute_limit)
            .finish()
    }
}

/// Runs the filter for a route's scheme, guarded per IP against brute force.
#[derive(Clone)]
pub struct AuthFilterChain {
    bearer: BearerFilter,
    api_key: ApiKeyFilter,
    failure_guard: Option<Arc<AuthFailureGuard>>,
}

impl AuthFilterChain {
    pub fn new(
        bearer: BearerFilter,
        api_key: ApiKeyFilter,
        failure_guard: Option<Arc<AuthFailureGuard>>,
    ) -> Self {
        Self {
            bearer,
            api_key,
            failure_guard,
        }
    }

    pub fn failure_guard(&self) -> Option<&Arc<AuthFailureGuard>> {
        self.failure_guard.as_ref()
    }

    /// Authenticate a request for `scheme`.
    ///
    /// `NONE` returns the anonymous identity without touching any filter or the
    /// failure guard.
    ///
    /// # Errors
    ///
    /// - `RateLimited` when `client_ip` has exhausted its failure budget
    /// - `AuthRejected` for a missing, malformed, invalid or expired credential
    /// - `AuthServiceUnavailable` when verification could not be completed
    pub async fn authenticate(
        &self,
        scheme: AuthScheme,
        headers: &HeaderMap,
        client_ip: &str,
    ) -> Result<Identity, GatewayError> {
        if scheme == AuthScheme::None {
            return Ok(Identity::Anonymous {
                client_ip: client_ip.to_string(),
            });
        }

        if let Some(guard) = &self.failure_guard
            && let Err(retry_after) = guard.check(client_ip)
        {
            warn!(
                client_ip = %client_ip,
                retry_after_secs = retry_after.as_secs(),
                "IP blocked due to excessive auth failures"
            );
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
                limit: guard.limit_per_minute(),
            });
        }

        let result = match scheme {
            AuthScheme::Bearer => self.bearer.authenticate(headers).await,
            AuthScheme::ApiKey => self.api_key.authenticate(headers).await,
            AuthScheme::None => Ok(Identity::Anonymous {
                client_ip: client_ip.to_string(),
            }),
        };

        match &result {
            Ok(identity) => {
                debug!(identity = ?identity, scheme = %scheme, "Authentication successful");
            }
            Err(GatewayError::AuthRejected(reason)) => {
                if let Some(guard) = &self.failure_guard {
                    guard.record_failure(client_ip);
                }
                crate::metrics::record_auth_failure(&scheme.to_string(), "rejected");
                warn!(client_ip = %client_ip, scheme = %scheme, reason = %reason, "Authentication rejected");
            }
            Err(e) => {
                crate::metrics::record_auth_failure(&scheme.to_string(), e.kind());
                warn!(client_ip = %client_ip, scheme = %scheme, error = %e, "Authentication could not be completed");
            }
        }

        result
    }
}
