//! Error types for the Ledger Service

use actix_web::{error::BlockingError, HttpResponse, ResponseError};
use securechat_ledger::LedgerError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Service-specific errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ledger operation failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Blocking worker pool failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl ServiceError {
    fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Ledger(LedgerError::InvalidInput(_)) => "bad_request",
            ServiceError::Ledger(e) if e.is_transient() => "retry_later",
            _ => "internal_error",
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self.code() {
            "not_found" => StatusCode::NOT_FOUND,
            "bad_request" => StatusCode::BAD_REQUEST,
            "retry_later" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let code = self.code();
        let message = if code == "internal_error" {
            error!("Request failed: {}", self);
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: code,
            message,
        })
    }
}

impl From<BlockingError> for ServiceError {
    fn from(err: BlockingError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}
