use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared::{codes, ApiEnvelope};
use thiserror::Error;

use crate::auth::TokenError;

/// Errors returned by REST handlers, rendered as `{ success: false, error: { code, message } }`
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Access token missing, malformed or expired
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Refresh token rejected
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// External identity exchange failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => codes::VALIDATION_ERROR,
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::InvalidToken(_) => codes::INVALID_TOKEN,
            AppError::AuthFailed(_) => codes::AUTH_FAILED,
            AppError::Forbidden(_) => codes::FORBIDDEN,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Conflict(_) => codes::CONFLICT,
            AppError::Internal(_) => codes::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::InvalidToken(_) | AppError::AuthFailed(_) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                "Internal server error".to_string()
            }
            AppError::BadRequest(m)
            | AppError::Unauthorized(m)
            | AppError::InvalidToken(m)
            | AppError::AuthFailed(m)
            | AppError::Forbidden(m)
            | AppError::NotFound(m)
            | AppError::Conflict(m) => m.clone(),
        };
        let body = ApiEnvelope::<()>::err(self.code(), message);
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

/// Access-token failures. Refresh-token failures are mapped at the refresh endpoint.
impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AppError::Unauthorized("Access token expired".to_string()),
            TokenError::Invalid => AppError::Unauthorized("Invalid access token".to_string()),
            TokenError::Signing(msg) => AppError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = AppError::Forbidden("Requires admin role".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "FORBIDDEN");
        assert_eq!(json["error"]["message"], "Requires admin role");
    }

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let response = AppError::Internal("database is locked".to_string()).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(json["error"]["message"], "Internal server error");
    }

    #[test]
    fn test_token_errors_map_to_unauthorized() {
        assert_eq!(AppError::from(TokenError::Expired).code(), "UNAUTHORIZED");
        assert_eq!(AppError::from(TokenError::Invalid).code(), "UNAUTHORIZED");
    }
}
