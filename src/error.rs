use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Authentication required: {0}")]
    AuthMissing(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry of the same operation could reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamUnavailable(_) | AppError::RateLimited(_)
        )
    }

    /// Classify a reqwest failure: connect/timeout problems are upstream
    /// unavailability; anything else is internal.
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            AppError::UpstreamUnavailable(format!("{context}: {err}"))
        } else {
            AppError::Internal(format!("{context}: {err}"))
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Internal and database failures get a sanitized message; the detail
        // is logged with a correlation id the client can quote back.
        let correlation_id = Uuid::new_v4();
        let (status, message) = match &self {
            AppError::ConfigInvalid(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::AuthMissing(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "Upstream rate limited, retry later".to_string(),
            ),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Database(e) => {
                tracing::error!(%correlation_id, error = %e, "document store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(e) => {
                tracing::error!(%correlation_id, error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
            "correlation_id": correlation_id,
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
