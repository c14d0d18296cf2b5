use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::twitter::CrawlError;

/// Structured JSON error body returned by all API error responses.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Unified application error type.
///
/// Implements [`IntoResponse`] so handlers can return `Result<T, AppError>`
/// and axum will convert errors into structured JSON responses with the
/// appropriate HTTP status code.
pub enum AppError {
    /// Input validation failed (400).
    Validation(String),
    /// Every upstream client is exhausted (429).
    TooManyRequests(String),
    /// The platform refused or garbled the request (502).
    BadGateway(String),
    /// Internal server error (500).
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg)
            }
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        (status, Json(ApiErrorBody { code, message })).into_response()
    }
}

impl From<CrawlError> for AppError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::RateLimited { .. } => AppError::TooManyRequests(err.to_string()),
            CrawlError::UnexpectedStatus(_) | CrawlError::Api(_) | CrawlError::Http(_) => {
                AppError::BadGateway(err.to_string())
            }
            CrawlError::Json(_) => AppError::Internal(err.to_string()),
        }
    }
}
