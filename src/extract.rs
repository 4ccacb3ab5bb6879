//! Extractors used by the services behind the gateway.

use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// Header carrying the verified user id, set by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity as asserted by the gateway.
///
/// Services are only reachable through the gateway, which strips any
/// client-supplied `x-user-id` and sets its own after verifying the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for TrustedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| TrustedUser(v.to_string()))
            .ok_or_else(|| AppError::Unauthenticated("Unauthorized".to_string()))
    }
}

/// JSON body whose parse failures render the uniform error envelope.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        Ok(JsonBody(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn extract(header: Option<&str>) -> Result<TrustedUser, AppError> {
        let mut builder = axum::http::Request::builder().uri("/api/posts");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        TrustedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_user_header_extracted() {
        assert_eq!(extract(Some("user-1")).await.unwrap().0, "user-1");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let req = axum::http::Request::builder()
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let result = JsonBody::<serde_json::Value>::from_request(req, &()).await;
        let err = result.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_or_blank_header_rejected() {
        assert!(matches!(
            extract(None).await,
            Err(AppError::Unauthenticated(_))
        ));
        assert!(matches!(
            extract(Some("  ")).await,
            Err(AppError::Unauthenticated(_))
        ));
    }
}
