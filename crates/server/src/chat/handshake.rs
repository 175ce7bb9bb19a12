use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::Role;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    auth::TokenError,
    authz::Access,
    state::AppState,
};

use super::Phase;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub workspace_id: Option<String>,
    /// Fallback for clients that cannot set headers on the upgrade request
    pub token: Option<String>,
}

/// Handshake failures. Rendered as plain HTTP responses; the socket is never upgraded.
#[derive(Debug, Error)]
pub enum HandshakeRejection {
    #[error("missing access token")]
    MissingToken,
    #[error("access token rejected: {0}")]
    Token(#[from] TokenError),
    #[error("user no longer exists")]
    UnknownUser,
    #[error("missing or malformed workspace id")]
    BadWorkspace,
    #[error("not a member of this workspace")]
    Forbidden,
    #[error("handshake failed: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HandshakeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeRejection::MissingToken
            | HandshakeRejection::Token(_)
            | HandshakeRejection::UnknownUser => StatusCode::UNAUTHORIZED,
            HandshakeRejection::BadWorkspace => StatusCode::BAD_REQUEST,
            HandshakeRejection::Forbidden => StatusCode::FORBIDDEN,
            HandshakeRejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HandshakeRejection {
    fn into_response(self) -> Response {
        if let HandshakeRejection::Internal(e) = &self {
            tracing::error!("chat handshake failed: {:#}", e);
        }
        // Internals and token verification details stay server-side
        let body = match self.status() {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::BAD_REQUEST => "bad request",
            StatusCode::FORBIDDEN => "forbidden",
            _ => "internal server error",
        };
        (self.status(), body).into_response()
    }
}

/// Identity and access established by a successful handshake
#[derive(Debug, Clone)]
pub struct Admitted {
    pub user_id: Uuid,
    pub display_name: String,
    pub workspace_id: Uuid,
    pub role: Role,
    /// Expiry of the access token presented at handshake
    pub token_expires_at: DateTime<Utc>,
}

/// Authenticate, then authorize the caller for the workspace's room at `viewer` level.
pub async fn authorize(
    state: &AppState,
    token: Option<&str>,
    workspace_id: Option<&str>,
) -> Result<Admitted, HandshakeRejection> {
    tracing::trace!(phase = ?Phase::Handshake, "chat upgrade requested");

    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(HandshakeRejection::MissingToken)?;
    let verified = state.tokens.verify_access(token)?;

    let workspace_id = workspace_id
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .ok_or(HandshakeRejection::BadWorkspace)?;

    let role = match state
        .gate
        .check(verified.user_id, workspace_id, Role::Viewer)
        .await?
    {
        Access::Allow(role) => role,
        Access::Deny => return Err(HandshakeRejection::Forbidden),
    };

    let user = state
        .db
        .get_user_by_id(verified.user_id)
        .await?
        .ok_or(HandshakeRejection::UnknownUser)?;

    Ok(Admitted {
        user_id: verified.user_id,
        display_name: user.display_name().to_string(),
        workspace_id,
        role,
        token_expires_at: verified.expires_at,
    })
}
