use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Every variant renders the uniform envelope `{success: false, message, error?}`.
/// Variants that wrap backend failures (store, cache, broker, object storage)
/// keep their detail for the server log only; clients see a generic message.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream {service} failed: {reason}")]
    Upstream { service: String, reason: String },

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Message broker error: {0}")]
    Broker(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SerializationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) | AppError::InvalidCredential(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream { .. }
            | AppError::CircuitOpen(_)
            | AppError::Store(_)
            | AppError::Cache(_)
            | AppError::Broker(_)
            | AppError::Storage(_)
            | AppError::OperationTimeout(_)
            | AppError::Internal(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is a connection-level broker problem that warrants
    /// a reconnect before retrying.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, AppError::Broker(_) | AppError::OperationTimeout(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Store(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Cache(e.to_string())
    }
}

/// Error envelope returned to clients.
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Full detail stays server-side
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let (message, error) = match &self {
            AppError::Validation(details) => {
                ("Validation error".to_string(), Some(details.clone()))
            }
            AppError::BadRequest(msg) => (msg.clone(), None),
            AppError::SerializationError(e) => ("Validation error".to_string(), Some(sanitize_serde_error(e))),
            AppError::Unauthenticated(msg) => (msg.clone(), None),
            AppError::InvalidCredential(_) => ("Invalid token".to_string(), None),
            AppError::NotFound(msg) => (msg.clone(), None),
            AppError::RateLimited { .. } => ("Too many requests".to_string(), None),
            AppError::Upstream { .. } | AppError::CircuitOpen(_) => (
                "Internal server error".to_string(),
                Some("Upstream service unavailable".to_string()),
            ),
            _ => ("Internal server error".to_string(), None),
        };

        let body = ErrorResponse {
            success: false,
            message,
            error,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = self
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg.get(start + 1..).and_then(|rest| rest.find('`'))
        && let Some(field) = msg.get(start + 1..start + 1 + end)
    {
        return format!("\"{field}\" is required");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
