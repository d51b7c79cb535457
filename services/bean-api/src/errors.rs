use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use bean_ledger::{ErrorClass, LedgerError};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("admin access required")]
    Forbidden,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.public_message(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Ledger(err) => match err.class() {
                ErrorClass::Validation => StatusCode::BAD_REQUEST,
                ErrorClass::NotFound => StatusCode::NOT_FOUND,
                ErrorClass::Conflict => match err {
                    LedgerError::InsufficientBalance { .. }
                    | LedgerError::InsufficientBalanceForGift { .. } => StatusCode::BAD_REQUEST,
                    LedgerError::NotGiftLinkOwner => StatusCode::FORBIDDEN,
                    _ => StatusCode::CONFLICT,
                },
                ErrorClass::Integrity => StatusCode::UNAUTHORIZED,
                ErrorClass::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Ledger(err) => err.kind(),
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Message shown to clients; store and configuration details stay in the logs
    fn public_message(&self) -> String {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
            return "internal server error".to_string();
        }
        self.to_string()
    }
}
