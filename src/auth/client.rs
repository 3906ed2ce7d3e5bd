//! HTTP client for the Auth Service.
//!
//! | Capability         | Request                                           |
//! |--------------------|---------------------------------------------------|
//! | token verification | `POST /api/v1/auth/verify-token` body `{"token"}` |
//! | API key validation | `GET /api/v1/api-keys/validate/{key}`             |
//!
//! Status mapping for both calls:
//!
//! - `2xx` → parse the body; an unparseable body is treated as unavailable
//! - `4xx` → credential invalid
//! - `5xx`, transport error, timeout → [`VerifyError::Unavailable`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::VerifyError;
use super::api_key::{ApiKeyDetails, ApiKeyValidator};
use super::bearer::{TokenVerification, TokenVerifier};

const VERIFY_TOKEN_PATH: &str = "/api/v1/auth/verify-token";
const VALIDATE_KEY_SEGMENTS: [&str; 4] = ["api", "v1", "api-keys", "validate"];

#[derive(Serialize)]
struct VerifyTokenRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Clone)]
pub struct AuthServiceClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl AuthServiceClient {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn validate_url(&self, key: &str) -> Result<Url, VerifyError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| VerifyError::Unavailable(format!("invalid auth service URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| VerifyError::Unavailable("auth service URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(VALIDATE_KEY_SEGMENTS)
            .push(key);
        Ok(url)
    }

    /// Map a response to `Some(body)`, `None` (credential invalid) or an error.
    async fn interpret<T: DeserializeOwned>(
        response: Result<reqwest::Response, reqwest::Error>,
        operation: &'static str,
    ) -> Result<Option<T>, VerifyError> {
        let response = response.map_err(|e| {
            let reason = if e.is_timeout() { "timed out" } else { "transport error" };
            warn!(operation, error = %e, "Auth service {reason}");
            VerifyError::Unavailable(format!("{operation} {reason}: {e}"))
        })?;

        let status = response.status();
        if status.is_server_error() {
            warn!(operation, status = %status, "Auth service returned server error");
            return Err(VerifyError::Unavailable(format!(
                "{operation} returned {status}"
            )));
        }
        if status.is_client_error() {
            if !matches!(
                status,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
            ) {
                debug!(operation, status = %status, "Auth service rejected credential with unexpected status");
            }
            return Ok(None);
        }

        response.json::<T>().await.map(Some).map_err(|e| {
            warn!(operation, error = %e, "Auth service returned an unreadable body");
            VerifyError::Unavailable(format!("{operation} returned an unreadable body: {e}"))
        })
    }
}

#[async_trait]
impl TokenVerifier for AuthServiceClient {
    async fn verify(&self, token: &str) -> Result<TokenVerification, VerifyError> {
        let response = self
            .http
            .post(format!("{}{VERIFY_TOKEN_PATH}", self.base_url))
            .timeout(self.timeout)
            .json(&VerifyTokenRequest { token })
            .send()
            .await;

        Ok(Self::interpret::<TokenVerification>(response, "verify-token")
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl ApiKeyValidator for AuthServiceClient {
    async fn validate(&self, key: &str) -> Result<ApiKeyDetails, VerifyError> {
        let url = self.validate_url(key)?;
        let response = self.http.get(url).timeout(self.timeout).send().await;

        Ok(Self::interpret::<ApiKeyDetails>(response, "validate-api-key")
            .await?
            .unwrap_or_else(ApiKeyDetails::invalid))
    }
}
