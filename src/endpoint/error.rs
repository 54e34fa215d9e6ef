//! API error types and response formatting.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::FeedError;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid admin token.
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Feed(#[from] FeedError),

    /// A blocking task failed to complete.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            Self::Feed(err) => match err {
                FeedError::FeedNotFound(_) | FeedError::EntryNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", Some(err.to_string()))
                }
                err if err.is_client_error() => {
                    tracing::debug!(error = %err, "rejected request");
                    (StatusCode::BAD_REQUEST, "bad_request", Some(err.to_string()))
                }
                FeedError::HubTimeout(_) => {
                    tracing::warn!(error = %err, "hub timed out");
                    (StatusCode::GATEWAY_TIMEOUT, "hub_timeout", Some(err.to_string()))
                }
                FeedError::Hub(_) | FeedError::HubRejected(_) => {
                    tracing::warn!(error = %err, "hub request failed");
                    (StatusCode::BAD_GATEWAY, "hub_error", Some(err.to_string()))
                }
                err => {
                    tracing::error!(error = %err, "internal server error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        Some("An internal error occurred".to_string()),
                    )
                }
            },
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some("An internal error occurred".to_string()),
                )
            }
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}
