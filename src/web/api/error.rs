use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    scheduler::parser::ParseError, scheduler::storage::StorageError,
    web::auth::PermissionError,
};

pub enum ApiError {
    Permission(PermissionError),
    Validation(String),
    NotFound(String),
    Conflict(String),
    Storage(String),
    Unavailable(&'static str),
}

impl From<PermissionError> for ApiError {
    fn from(e: PermissionError) -> Self {
        ApiError::Permission(e)
    }
}

impl From<ParseError> for ApiError {
    fn from(e: ParseError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => ApiError::NotFound(id),
            StorageError::Overlap(id) => ApiError::Conflict(id),
            StorageError::OutOfRange => ApiError::Validation(e.to_string()),
            _ => ApiError::Storage(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Permission(e) => return e.into_response(),
            ApiError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_message("validation_failed", &msg),
            ),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_message("not_found", &id),
            ),
            ApiError::Conflict(id) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_message("overlaps_existing_request", &id),
            ),
            ApiError::Storage(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_message("storage_error", &msg),
            ),
            ApiError::Unavailable(reason) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::new(reason))
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        ErrorResponse {
            error: error.to_string(),
            message: None,
        }
    }

    pub fn with_message(error: &str, message: &str) -> Self {
        ErrorResponse {
            error: error.to_string(),
            message: Some(message.to_string()),
        }
    }
}
