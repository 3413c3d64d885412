//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Every requested video is already completed or claimed
    #[error("Nothing to do: {0}")]
    NothingToDo(String),

    /// The run has no process id and no heartbeat to reach it through
    #[error("Not cancellable: {0}")]
    NotCancellable(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn nothing_to_do(msg: impl Into<String>) -> Self {
        Self::NothingToDo(msg.into())
    }

    pub fn not_cancellable(msg: impl Into<String>) -> Self {
        Self::NotCancellable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NothingToDo(_) | ApiError::NotCancellable(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::NothingToDo(_) => "nothing_to_do",
            ApiError::NotCancellable(_) => "not_cancellable",
            ApiError::RateLimited => "rate_limited",
            ApiError::Internal(_) | ApiError::Store(_) => "internal_error",
        }
    }

    /// Message without the variant prefix.
    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::Validation(msg)
            | ApiError::NothingToDo(msg)
            | ApiError::NotCancellable(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::RateLimited => "Rate limit exceeded".to_string(),
            ApiError::Store(e) => e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal error details in production
        let error = match &self {
            ApiError::Internal(_) | ApiError::Store(_) => {
                tracing::error!("Request failed: {}", self);
                if std::env::var("ENVIRONMENT").unwrap_or_default() == "production" {
                    "An internal error occurred".to_string()
                } else {
                    self.message()
                }
            }
            _ => self.message(),
        };

        let body = ErrorResponse {
            success: false,
            error,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}
