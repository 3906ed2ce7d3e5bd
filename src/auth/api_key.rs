use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;

use super::{API_KEY_HEADER, ApiKeyIdentity, Identity, VerifyError};
use crate::error::GatewayError;

/// What the Auth Service knows about an API key.
///
/// Older deployments answer `validate/{key}` with a bare JSON boolean; newer
/// ones return an object. Both deserialize into this type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeyDetails {
    pub valid: bool,
    pub owner_id: Option<String>,
    pub key_id: Option<String>,
    pub scopes: Vec<String>,
    pub rate_limit_per_minute: Option<u32>,
}

impl ApiKeyDetails {
    pub fn invalid() -> Self {
        Self::default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValidateResponse {
    Bare(bool),
    Detailed(DetailedResponse),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailedResponse {
    valid: bool,
    #[serde(default)]
    owner_id: Option<serde_json::Value>,
    #[serde(default)]
    key_id: Option<serde_json::Value>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

/// Ids may arrive as strings or numbers.
fn id_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl<'de> Deserialize<'de> for ApiKeyDetails {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ValidateResponse::deserialize(deserializer)? {
            ValidateResponse::Bare(valid) => ApiKeyDetails {
                valid,
                ..ApiKeyDetails::default()
            },
            ValidateResponse::Detailed(d) => ApiKeyDetails {
                valid: d.valid,
                owner_id: d.owner_id.and_then(id_to_string),
                key_id: d.key_id.and_then(id_to_string),
                scopes: d.scopes,
                rate_limit_per_minute: d.rate_limit_per_minute.filter(|limit| *limit > 0),
            },
        })
    }
}

/// Validates API keys, typically against the Auth Service.
#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    /// # Errors
    ///
    /// Returns `VerifyError::Unavailable` if validation could not be completed.
    /// An unknown or revoked key is `Ok` with `valid = false`.
    async fn validate(&self, key: &str) -> Result<ApiKeyDetails, VerifyError>;
}

/// `X-API-KEY` filter.
#[derive(Clone)]
pub struct ApiKeyFilter {
    validator: Arc<dyn ApiKeyValidator>,
}

impl ApiKeyFilter {
    pub fn new(validator: Arc<dyn ApiKeyValidator>) -> Self {
        Self { validator }
    }

    /// # Errors
    ///
    /// `AuthRejected` for a missing, empty or invalid key;
    /// `AuthServiceUnavailable` if the validator failed.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::AuthRejected("Missing API key".to_string()))?;

        let details = self
            .validator
            .validate(key)
            .await
            .map_err(|e| GatewayError::AuthServiceUnavailable(e.to_string()))?;

        if !details.valid {
            return Err(GatewayError::AuthRejected("Invalid API key".to_string()));
        }

        Ok(Identity::ApiKey(ApiKeyIdentity {
            key: key.to_string(),
            owner_id: details.owner_id,
            key_id: details.key_id,
            scopes: details.scopes,
            per_minute_limit: details.rate_limit_per_minute,
        }))
    }
}
