//! API Error Types
//!
//! Maps facade and query failures onto HTTP status codes and the
//! Prometheus `errorType` vocabulary.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::dto::ErrorResponse;
use crate::query::QueryError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request parameters failed validation
    #[error("{0}")]
    BadRequest(String),

    /// Origin not allowed by the CORS pattern
    #[error("{0}")]
    Forbidden(String),

    /// Parsing, admission or evaluation failed
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    /// HTTP status and `errorType` reported for this error
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_data"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ApiError::Query(e) => match e {
                QueryError::Parse(_) | QueryError::BadRequest(_) => {
                    (StatusCode::BAD_REQUEST, "bad_data")
                }
                QueryError::TooManySamples { .. }
                | QueryError::TypeMismatch(_)
                | QueryError::UnknownFunction(_)
                | QueryError::Execution(_) => (StatusCode::UNPROCESSABLE_ENTITY, "execution"),
                QueryError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "canceled"),
                QueryError::DeadlineExceeded => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
                QueryError::QueueTimeout => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                QueryError::StorageReadFailed(_) | QueryError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                error_type,
                error_message = %self,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_type,
                error_message = %self,
                "request rejected"
            );
        }

        let body = ErrorResponse {
            status: "error".to_string(),
            error_type: error_type.to_string(),
            error: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
