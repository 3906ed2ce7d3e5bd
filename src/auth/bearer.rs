use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

use super::{Identity, VerifyError};
use crate::error::GatewayError;

const BEARER_PREFIX: &str = "Bearer ";

/// Outcome of verifying one bearer token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenVerification {
    pub valid: bool,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

/// Anything that can verify a bearer token: local JWT check or remote call.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns `VerifyError::Unavailable` if verification could not be completed.
    /// An invalid token is `Ok` with `valid = false`.
    async fn verify(&self, token: &str) -> Result<TokenVerification, VerifyError>;
}

/// `Authorization: Bearer <token>` filter.
#[derive(Clone)]
pub struct BearerFilter {
    verifier: Arc<dyn TokenVerifier>,
}

impl BearerFilter {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// # Errors
    ///
    /// `AuthRejected` for a missing/malformed header or an invalid, expired or
    /// subject-less token; `AuthServiceUnavailable` if the verifier failed.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let token = extract_bearer(headers)?;

        let verification = self
            .verifier
            .verify(token)
            .await
            .map_err(|e| GatewayError::AuthServiceUnavailable(e.to_string()))?;

        if !verification.valid {
            return Err(GatewayError::AuthRejected("Invalid token".to_string()));
        }

        if verification
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now())
        {
            return Err(GatewayError::AuthRejected("Token expired".to_string()));
        }

        let subject = verification
            .subject
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::AuthRejected("Token has no subject".to_string()))?;

        Ok(Identity::Bearer {
            subject,
            claims: verification.claims,
        })
    }
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| GatewayError::AuthRejected("Missing authorization header".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GatewayError::AuthRejected("Invalid authorization header".to_string()))
}

/// Accept `expiresAt` as epoch seconds or an RFC 3339 string.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expiry {
        Seconds(i64),
        Timestamp(DateTime<Utc>),
    }

    match Option::<Expiry>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Expiry::Timestamp(ts)) => Ok(Some(ts)),
        Some(Expiry::Seconds(secs)) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid expiry timestamp {secs}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::Duration;

    use super::*;

    struct Fixed(TokenVerification);

    #[async_trait]
    impl TokenVerifier for Fixed {
        async fn verify(&self, _token: &str) -> Result<TokenVerification, VerifyError> {
            Ok(self.0.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl TokenVerifier for Down {
        async fn verify(&self, _token: &str) -> Result<TokenVerification, VerifyError> {
            Err(VerifyError::Unavailable("connection refused".to_string()))
        }
    }

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    fn valid(subject: &str) -> TokenVerification {
        TokenVerification {
            valid: true,
            subject: Some(subject.to_string()),
            expires_at: Some(Utc::now() + Duration::minutes(5)),
            claims: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let filter = BearerFilter::new(Arc::new(Fixed(valid("user-1"))));
        let identity = filter.authenticate(&headers("Bearer abc")).await.unwrap();
        assert_eq!(identity.user_id(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_header() {
        let filter = BearerFilter::new(Arc::new(Fixed(valid("user-1"))));

        let err = filter.authenticate(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthRejected(_)));

        for bad in ["Basic dXNlcjpwYXNz", "Bearer ", "bearer abc", "Bearer    "] {
            let mut h = HeaderMap::new();
            h.insert(AUTHORIZATION, HeaderValue::from_str(bad).unwrap());
            let err = filter.authenticate(&h).await.unwrap_err();
            assert!(matches!(err, GatewayError::AuthRejected(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mut verification = valid("user-1");
        verification.expires_at = Some(Utc::now() - Duration::seconds(1));
        let filter = BearerFilter::new(Arc::new(Fixed(verification)));

        let err = filter.authenticate(&headers("Bearer abc")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthRejected(msg) if msg == "Token expired"));
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let filter = BearerFilter::new(Arc::new(Fixed(TokenVerification::default())));
        let err = filter.authenticate(&headers("Bearer abc")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_verifier_down_is_unavailable() {
        let filter = BearerFilter::new(Arc::new(Down));
        let err = filter.authenticate(&headers("Bearer abc")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthServiceUnavailable(_)));
    }

    #[test]
    fn test_verification_response_formats() {
        let v: TokenVerification =
            serde_json::from_str(r#"{"valid":true,"subject":"u1","expiresAt":4102444800}"#)
                .unwrap();
        assert_eq!(v.expires_at.unwrap().timestamp(), 4_102_444_800);

        let v: TokenVerification = serde_json::from_str(
            r#"{"valid":true,"subject":"u1","expiresAt":"2100-01-01T00:00:00Z","claims":{"role":"admin"}}"#,
        )
        .unwrap();
        assert_eq!(v.expires_at.unwrap().timestamp(), 4_102_444_800);
        assert_eq!(v.claims["role"], "admin");

        let v: TokenVerification = serde_json::from_str(r#"{"valid":false}"#).unwrap();
        assert!(!v.valid);
        assert!(v.expires_at.is_none());
    }
}
