use axum::{
    extract::{Path, State},
    Json,
};
use shared::{
    ApiEnvelope, CreateWorkspaceRequest, InviteRequest, MemberInfo, Role, UpdateRoleRequest,
    WorkspaceInfo,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    db::Workspace,
    error::AppError,
    state::AppState,
};

const MAX_WORKSPACE_NAME_CHARS: usize = 100;

pub async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateWorkspaceRequest>,
) -> Result<Json<ApiEnvelope<WorkspaceInfo>>, AppError> {
    let name = req.name.trim();
    if name.is_empty() || name.chars().count() > MAX_WORKSPACE_NAME_CHARS {
        return Err(AppError::BadRequest(format!(
            "Workspace name must be between 1 and {} characters",
            MAX_WORKSPACE_NAME_CHARS
        )));
    }
    let description = req
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    let workspace = state
        .db
        .create_workspace(auth.user_id, name, description)
        .await?;
    tracing::info!("Workspace {} created by {}", workspace.id, auth.user_id);

    let info = workspace_info(&state, &workspace, Role::Admin).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

pub async fn show(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiEnvelope<WorkspaceInfo>>, AppError> {
    let workspace = find_workspace(&state, id).await?;
    let role = state.gate.require(auth.user_id, id, Role::Viewer).await?;
    let info = workspace_info(&state, &workspace, role).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

pub async fn invite(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<InviteRequest>,
) -> Result<Json<ApiEnvelope<WorkspaceInfo>>, AppError> {
    let workspace = find_workspace(&state, id).await?;
    let role = state.gate.require(auth.user_id, id, Role::Admin).await?;

    let email = req.email.trim();
    if !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required".to_string()));
    }
    let invitee = state
        .db
        .get_user_by_email(email)
        .await?
        .ok_or_else(|| AppError::NotFound("No user with that email".to_string()))?;
    let invitee_id = invitee.uuid()?;

    if invitee_id == workspace.owner_uuid()? {
        return Err(AppError::Conflict(
            "The owner is already an admin of this workspace".to_string(),
        ));
    }
    if !state.db.add_member(id, invitee_id, req.role).await? {
        return Err(AppError::Conflict("User is already a member".to_string()));
    }
    tracing::info!("User {} added to workspace {} as {}", invitee_id, id, req.role);

    let info = workspace_info(&state, &workspace, role).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<ApiEnvelope<WorkspaceInfo>>, AppError> {
    let workspace = find_workspace(&state, id).await?;
    let role = state.gate.require(auth.user_id, id, Role::Admin).await?;

    if user_id == workspace.owner_uuid()? {
        return Err(AppError::BadRequest("The owner's role cannot be changed".to_string()));
    }
    if !state.db.update_member_role(id, user_id, req.role).await? {
        return Err(AppError::NotFound("Member not found".to_string()));
    }
    state.registry.apply_role_change(
        id,
        user_id,
        Some(req.role),
        state.config.chat.revoke_on_membership_change,
    );
    tracing::info!("User {} is now {} in workspace {}", user_id, req.role, id);

    let info = workspace_info(&state, &workspace, role).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

pub async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiEnvelope<WorkspaceInfo>>, AppError> {
    let workspace = find_workspace(&state, id).await?;
    let role = state.gate.require(auth.user_id, id, Role::Admin).await?;

    if user_id == workspace.owner_uuid()? {
        return Err(AppError::BadRequest("The owner cannot be removed".to_string()));
    }
    if !state.db.remove_member(id, user_id).await? {
        return Err(AppError::NotFound("Member not found".to_string()));
    }
    let closed = state.registry.apply_role_change(
        id,
        user_id,
        None,
        state.config.chat.revoke_on_membership_change,
    );
    tracing::info!(
        "User {} removed from workspace {} ({} live connections affected)",
        user_id,
        id,
        closed
    );

    let info = workspace_info(&state, &workspace, role).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

async fn find_workspace(state: &AppState, id: Uuid) -> Result<Workspace, AppError> {
    state
        .db
        .get_workspace(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workspace not found".to_string()))
}

async fn workspace_info(
    state: &AppState,
    workspace: &Workspace,
    role: Role,
) -> Result<WorkspaceInfo, AppError> {
    let id = workspace.uuid()?;
    let members = state
        .db
        .list_members(id)
        .await?
        .iter()
        .map(|m| m.to_info())
        .collect::<anyhow::Result<Vec<MemberInfo>>>()?;

    Ok(WorkspaceInfo {
        id,
        name: workspace.name.clone(),
        description: workspace.description.clone(),
        owner_id: workspace.owner_uuid()?,
        members,
        role,
        created_at: workspace.created_at_utc(),
    })
}
