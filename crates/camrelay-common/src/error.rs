//! Centralized error types for the camrelay HTTP surface.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that can be directly converted to API responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::errors::ErrorKind;
use serde::Serialize;

/// Error type returned by every camrelay route handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // === Auth errors ===
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Unauthorized")]
    Unauthorized,

    // === Request errors ===
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Infrastructure errors ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ApiError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::InvalidToken | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::TokenExpired,
            _ => Self::InvalidToken,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_401() {
        assert_eq!(ApiError::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::TokenExpired.error_code(), "TOKEN_EXPIRED");
        assert_eq!(
            ApiError::Validation { message: "bad".into() }.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn every_variant_has_a_status_and_code() {
        let cases = [
            (ApiError::InvalidCredentials, 401, "INVALID_CREDENTIALS"),
            (ApiError::TokenExpired, 401, "TOKEN_EXPIRED"),
            (ApiError::InvalidToken, 401, "INVALID_TOKEN"),
            (ApiError::Unauthorized, 401, "UNAUTHORIZED"),
            (ApiError::Validation { message: "x".into() }, 400, "VALIDATION_ERROR"),
            (ApiError::Internal(anyhow::anyhow!("x")), 500, "INTERNAL_ERROR"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code().as_u16(), status);
            assert_eq!(err.error_code(), code);
        }
    }

    #[test]
    fn expired_jwt_becomes_token_expired() {
        let err: ApiError = jsonwebtoken::errors::Error::from(ErrorKind::ExpiredSignature).into();
        assert!(matches!(err, ApiError::TokenExpired));
        let err: ApiError = jsonwebtoken::errors::Error::from(ErrorKind::InvalidSignature).into();
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[test]
    fn internal_errors_hide_details() {
        let response = ApiError::Internal(anyhow::anyhow!("db password is hunter2")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
