//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::ErrorCode;
use order::OrderError;
use wallet::WalletError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    Order(OrderError),
    Wallet(WalletError),
    /// Bad request from the client.
    BadRequest(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Order(e) => e.code(),
            ApiError::Wallet(e) => e.code(),
            ApiError::BadRequest(_) => ErrorCode::InvalidArgument,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Order(e) => e.to_string(),
            ApiError::Wallet(e) => e.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
        }
    }
}

/// HTTP status for a service error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::FailedPrecondition => StatusCode::CONFLICT,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::ResourceExhausted => StatusCode::PAYMENT_REQUIRED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        if code == ErrorCode::Internal {
            // The response body is scrubbed; keep the source in the log.
            match &self {
                ApiError::Order(e) => tracing::error!(error = ?e, "internal server error"),
                ApiError::Wallet(e) => tracing::error!(error = ?e, "internal server error"),
                ApiError::BadRequest(_) => {}
            }
        }

        let body = serde_json::json!({ "code": code.as_str(), "error": self.message() });
        (status_for(code), axum::Json(body)).into_response()
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        ApiError::Order(err)
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        ApiError::Wallet(err)
    }
}
