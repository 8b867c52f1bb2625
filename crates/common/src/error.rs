use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus error: {0}")]
    Bus(String),

    /// No credential in cookie, header, or query string.
    #[error("unauthenticated")]
    Unauthenticated,

    /// A credential was supplied but failed validation.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("upgrade required")]
    UpgradeRequired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Serialization(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Bus(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            // The validator's detail stays in the logs; clients only learn the class.
            AppError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated".to_string()),
            AppError::InvalidCredential(_) => {
                (StatusCode::UNAUTHORIZED, "invalid credential".to_string())
            }
            AppError::UpgradeRequired => {
                (StatusCode::UPGRADE_REQUIRED, "upgrade required".to_string())
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
