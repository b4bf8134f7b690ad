use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use validator::Validate;

use crate::errors::ServiceError;
use crate::ApiResponse;

/// 200 with the standard success envelope
pub fn success_response<T: Serialize>(data: T) -> impl IntoResponse {
    Json(ApiResponse::success(data))
}

/// 201 with the standard success envelope
pub fn created_response<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// 204 without a body
pub fn no_content_response() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Validates a request DTO, mapping validator errors into the shared taxonomy
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}
