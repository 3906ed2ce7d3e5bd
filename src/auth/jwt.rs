//! Local verification of bearer tokens signed with the Auth Service's shared
//! HMAC secret. The gateway never issues tokens.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::debug;

use super::VerifyError;
use super::bearer::{TokenVerification, TokenVerifier};

/// Registered claims the gateway relies on; everything else is kept verbatim.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: i64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct JwtVerifier {
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    fn verify_sync(&self, token: &str) -> TokenVerification {
        let algorithm = match decode_header(token) {
            Ok(header)
                if matches!(
                    header.alg,
                    Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
                ) =>
            {
                header.alg
            }
            Ok(header) => {
                debug!(alg = ?header.alg, "Rejecting token with non-HMAC algorithm");
                return TokenVerification::default();
            }
            Err(e) => {
                debug!(error = %e, "Rejecting malformed token");
                return TokenVerification::default();
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        match decode::<Claims>(token, &self.key, &validation) {
            Ok(data) => {
                let claims = data.claims;
                TokenVerification {
                    valid: true,
                    subject: claims.sub,
                    expires_at: Utc.timestamp_opt(claims.exp, 0).single(),
                    claims: claims.extra,
                }
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::ExpiredSignature => debug!("Rejecting expired token"),
                    kind => debug!(kind = ?kind, "Rejecting token"),
                }
                TokenVerification::default()
            }
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<TokenVerification, VerifyError> {
        Ok(self.verify_sync(token))
    }
}
