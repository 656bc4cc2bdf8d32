//! HTTP-facing error type.
//!
//! Codec failures are logged where they happen and reach the client only as
//! a generic message; the client never learns whether the input was corrupt
//! or the library failed.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::documents::DocumentError;
use crate::formats::ValidationError;
use crate::models::{ErrorBody, RateLimitedBody};
use crate::rate_limit::{RateLimitDecision, insert_rate_limit_headers, now_ms};

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited(RateLimitDecision),
    #[error("{0}")]
    ConversionFailed(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
            Self::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, message),
            Self::ConversionFailed(message) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            Self::RateLimited(decision) => {
                let retry_after = decision.retry_after_secs(now_ms());
                let body = RateLimitedBody {
                    error: RATE_LIMIT_MESSAGE.to_string(),
                    remaining: decision.remaining,
                    reset_time: decision.reset_time,
                    retry_after,
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                insert_rate_limit_headers(headers, &decision);
                headers.insert("retry-after", HeaderValue::from(retry_after));
                response
            }
        }
    }
}

// Only an unknown pair is the caller's fault; anything else is a library failure
impl From<DocumentError> for ApiError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Unsupported { .. } => Self::BadRequest(e.to_string()),
            other => Self::ConversionFailed(other.to_string()),
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
