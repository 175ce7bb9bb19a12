use axum::{extract::State, Json};
use shared::{
    ApiEnvelope, AuthCallbackRequest, AuthTokensResponse, AuthUrlResponse, RefreshRequest,
    RefreshResponse, UpdateProfileRequest, UserInfo,
};

use crate::{
    auth::{AuthUser, TokenError},
    error::AppError,
    identity::IdentityError,
    state::AppState,
};

const MAX_NAME_CHARS: usize = 100;

pub async fn google_url(
    State(state): State<AppState>,
) -> Result<Json<ApiEnvelope<AuthUrlResponse>>, AppError> {
    let url = state.identity.authorization_url().map_err(identity_error)?;
    Ok(Json(ApiEnvelope::ok(AuthUrlResponse { url })))
}

/// Exchange an authorization code for a session
pub async fn google_callback(
    State(state): State<AppState>,
    Json(req): Json<AuthCallbackRequest>,
) -> Result<Json<ApiEnvelope<AuthTokensResponse>>, AppError> {
    let code = req.code.trim();
    if code.is_empty() {
        return Err(AppError::BadRequest("Authorization code is required".to_string()));
    }

    let profile = state
        .identity
        .exchange_code(code)
        .await
        .map_err(identity_error)?;
    let user = state.db.upsert_user_from_profile(&profile).await?;
    let tokens = state.tokens.issue_tokens(user.uuid()?)?;

    tracing::info!("User {} signed in", user.id);

    Ok(Json(ApiEnvelope::ok(AuthTokensResponse {
        user: user.to_info()?,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_in: tokens.expires_in,
    })))
}

/// New access token for a refresh token. The refresh token is never reissued.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiEnvelope<RefreshResponse>>, AppError> {
    if req.refresh_token.trim().is_empty() {
        return Err(AppError::BadRequest("Refresh token is required".to_string()));
    }

    let verified = state
        .tokens
        .verify_refresh(&req.refresh_token)
        .map_err(refresh_error)?;
    if state.db.get_user_by_id(verified.user_id).await?.is_none() {
        return Err(AppError::InvalidToken("User not found".to_string()));
    }

    let (access_token, expires_in) = state
        .tokens
        .rotate_access(&req.refresh_token)
        .map_err(refresh_error)?;

    Ok(Json(ApiEnvelope::ok(RefreshResponse {
        access_token,
        expires_in,
    })))
}

pub async fn me(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ApiEnvelope<UserInfo>>, AppError> {
    let user = state
        .db
        .get_user_by_id(auth.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(ApiEnvelope::ok(user.to_info()?)))
}

pub async fn update_me(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<ApiEnvelope<UserInfo>>, AppError> {
    let name = req.name.as_deref().map(str::trim);
    if let Some(name) = name {
        if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
            return Err(AppError::BadRequest(format!(
                "Name must be between 1 and {} characters",
                MAX_NAME_CHARS
            )));
        }
    }

    let user = state
        .db
        .update_user_profile(auth.user_id, name, req.avatar.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(ApiEnvelope::ok(user.to_info()?)))
}

fn identity_error(e: IdentityError) -> AppError {
    match e {
        IdentityError::NotConfigured => AppError::Internal(e.to_string()),
        IdentityError::Rejected(_) | IdentityError::Transport(_) => {
            tracing::warn!("Identity exchange failed: {}", e);
            AppError::AuthFailed("Authentication with the identity provider failed".to_string())
        }
    }
}

fn refresh_error(e: TokenError) -> AppError {
    match e {
        TokenError::Signing(msg) => AppError::Internal(msg),
        TokenError::Expired | TokenError::Invalid => {
            AppError::InvalidToken("Invalid or expired refresh token".to_string())
        }
    }
}
