//! Request handlers.

pub mod callbacks;
pub mod health;
pub mod processing;

pub use callbacks::*;
pub use health::*;
pub use processing::*;

use axum::extract::rejection::JsonRejection;
use axum::Json;

use crate::error::{ApiError, ApiResult};

/// Unwrap a JSON body, reporting malformed input as a validation error.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::validation(rejection.body_text()))
}
