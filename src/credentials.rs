//! Bearer token verification at the gateway.
//!
//! Tokens are HS256 JWTs issued by the identity service and carry the user id
//! in a `userId` claim. Verification is a pure function of the token, the
//! shared secret and the clock.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Identity attached to a request after verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: String,
    exp: i64,
}

/// Verifies `Authorization: Bearer <token>` headers.
#[derive(Clone)]
pub struct CredentialValidator {
    key: DecodingKey,
    validation: Validation,
}

impl CredentialValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify the raw `Authorization` header value.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` when the header is absent or has no token segment
    /// - `InvalidCredential` when the signature, expiry or claims are invalid
    pub fn verify(&self, authorization: Option<&str>) -> AppResult<AuthenticatedIdentity> {
        let header = authorization
            .ok_or_else(|| AppError::Unauthenticated("Unauthorized".to_string()))?;
        let token = bearer_token(header)
            .ok_or_else(|| AppError::Unauthenticated("Unauthorized".to_string()))?;

        self.verify_token(token)
    }

    pub fn verify_token(&self, token: &str) -> AppResult<AuthenticatedIdentity> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AppError::InvalidCredential(e.to_string()))?;

        if data.claims.user_id.trim().is_empty() {
            return Err(AppError::InvalidCredential("empty userId claim".to_string()));
        }

        Ok(AuthenticatedIdentity {
            user_id: data.claims.user_id,
        })
    }
}

/// Token segment of a `Bearer <token>` header value.
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Sign a token for `user_id` valid for `ttl_secs`, in the format the
/// identity service issues.
pub fn sign_token(secret: &str, user_id: &str, ttl_secs: i64) -> AppResult<String> {
    let claims = Claims {
        user_id: user_id.to_string(),
        exp: Utc::now().timestamp() + ttl_secs,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {e}")))
}
