//! Workspace API Endpoints
//! Mission: Tenant CRUD, team management and invitations

use crate::app::AppState;
use crate::auth::{middleware::AuthUser, models::normalize_email};
use crate::error::{ApiError, ApiResult};
use crate::workspace::{
    models::{
        AcceptInvitationRequest, AddMemberRequest, CreateInvitationRequest,
        CreateWorkspaceRequest, InvitationStatus, MemberDetail, Membership, Role,
        UpdateRoleRequest, UpdateWorkspaceRequest, WorkspaceInvitation, WorkspaceSummary,
    },
    permissions::member_access,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

const MAX_NAME_LENGTH: usize = 255;

fn validate_name(name: &str) -> ApiResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name: This field may not be blank."));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::validation(format!(
            "name: Ensure this field has no more than {MAX_NAME_LENGTH} characters."
        )));
    }
    Ok(())
}

/// Parse a role that may be granted through the API (never `owner`)
fn grantable_role(raw: Option<&str>) -> ApiResult<Role> {
    let role = match raw {
        Some(r) => r.parse::<Role>().map_err(ApiError::Validation)?,
        None => Role::Member,
    };
    if role == Role::Owner {
        return Err(ApiError::validation("Cannot assign owner role"));
    }
    Ok(role)
}

async fn load_summary(state: &AppState, id: Uuid) -> ApiResult<WorkspaceSummary> {
    state
        .workspaces
        .summary(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Workspace not found"))
}

/// GET /api/v1/workspaces
pub async fn list_workspaces(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<WorkspaceSummary>>> {
    Ok(Json(state.workspaces.list_for_user(user.id).await?))
}

/// POST /api/v1/workspaces
pub async fn create_workspace(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateWorkspaceRequest>,
) -> ApiResult<(StatusCode, Json<WorkspaceSummary>)> {
    validate_name(&payload.name)?;

    let workspace = state
        .workspaces
        .create(&payload.name, &payload.description, user.id)
        .await?;
    Ok((StatusCode::CREATED, Json(load_summary(&state, workspace.id).await?)))
}

/// GET /api/v1/workspaces/:id
pub async fn get_workspace(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkspaceSummary>> {
    member_access(&state.workspaces, id, user.id).await?;
    Ok(Json(load_summary(&state, id).await?))
}

/// PATCH /api/v1/workspaces/:id
pub async fn update_workspace(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateWorkspaceRequest>,
) -> ApiResult<Json<WorkspaceSummary>> {
    member_access(&state.workspaces, id, user.id)
        .await?
        .require_admin()?;
    if let Some(name) = payload.name.as_deref() {
        validate_name(name)?;
    }

    state
        .workspaces
        .update(id, payload.name.as_deref(), payload.description.as_deref())
        .await?;
    Ok(Json(load_summary(&state, id).await?))
}

/// DELETE /api/v1/workspaces/:id
pub async fn delete_workspace(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    member_access(&state.workspaces, id, user.id)
        .await?
        .require_owner()?;

    state.workspaces.delete(id).await?;
    info!("🗑️  Workspace {} deleted by {}", id, user.email);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/workspaces/:id/members
pub async fn list_members(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<MemberDetail>>> {
    member_access(&state.workspaces, id, user.id).await?;
    Ok(Json(state.workspaces.list_members(id).await?))
}

/// POST /api/v1/workspaces/:id/members
pub async fn add_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<Membership>)> {
    member_access(&state.workspaces, id, user.id)
        .await?
        .require_admin()?;

    let target = payload
        .user_id
        .ok_or_else(|| ApiError::validation("user_id is required"))?;
    let role = grantable_role(payload.role.as_deref())?;

    if state.users.get_by_id(target).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }

    let membership = state
        .workspaces
        .add_member(id, target, role)
        .await?
        .ok_or_else(|| ApiError::validation("User is already a member"))?;

    info!("👥 {} added {} to workspace {} as {}", user.email, target, id, role);
    Ok((StatusCode::CREATED, Json(membership)))
}

/// PATCH /api/v1/workspaces/:id/members/:membership_id/update_role
pub async fn update_member_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, membership_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateRoleRequest>,
) -> ApiResult<Json<Membership>> {
    let access = member_access(&state.workspaces, id, user.id).await?;
    access.require_owner()?;

    let target = state
        .workspaces
        .membership_by_id(id, membership_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Membership not found"))?;

    if target.user_id == user.id {
        return Err(ApiError::validation("Cannot change your own role"));
    }
    if target.user_id == access.workspace.owner_id || target.role == Role::Owner {
        return Err(ApiError::validation("Cannot change the owner's role"));
    }
    let role = grantable_role(Some(&payload.role))?;

    let updated = state
        .workspaces
        .update_member_role(membership_id, role)
        .await?
        .ok_or_else(|| ApiError::not_found("Membership not found"))?;
    Ok(Json(updated))
}

/// DELETE /api/v1/workspaces/:id/members/:membership_id/remove
pub async fn remove_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path((id, membership_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let access = member_access(&state.workspaces, id, user.id).await?;
    access.require_admin()?;

    let target = state
        .workspaces
        .membership_by_id(id, membership_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Membership not found"))?;

    if target.user_id == access.workspace.owner_id || target.role == Role::Owner {
        return Err(ApiError::validation("Cannot remove workspace owner"));
    }
    if target.user_id == user.id {
        return Err(ApiError::validation("Cannot remove yourself"));
    }

    state.workspaces.remove_member(membership_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/workspaces/:id/invitations
pub async fn create_invitation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateInvitationRequest>,
) -> ApiResult<(StatusCode, Json<WorkspaceInvitation>)> {
    member_access(&state.workspaces, id, user.id)
        .await?
        .require_admin()?;

    let email = normalize_email(&payload.email)
        .ok_or_else(|| ApiError::validation("email: Enter a valid email address."))?;
    let role = grantable_role(payload.role.as_deref())?;

    if let Some(existing) = state.users.get_by_email(&email).await? {
        if state.workspaces.membership(id, existing.id).await?.is_some() {
            return Err(ApiError::validation("User is already a member"));
        }
    }

    let invitation = state
        .workspaces
        .create_invitation(id, &email, role, user.id)
        .await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

/// GET /api/v1/workspaces/:id/invitations
pub async fn list_invitations(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkspaceInvitation>>> {
    member_access(&state.workspaces, id, user.id)
        .await?
        .require_admin()?;
    Ok(Json(state.workspaces.list_invitations(id).await?))
}

/// POST /api/v1/invitations/accept
pub async fn accept_invitation(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AcceptInvitationRequest>,
) -> ApiResult<Json<Membership>> {
    let invitation = state
        .workspaces
        .invitation_by_token(payload.token.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("Invitation not found"))?;

    if invitation.status != InvitationStatus::Pending {
        return Err(ApiError::validation(format!(
            "Invitation is {}",
            invitation.status.as_str()
        )));
    }
    if invitation.is_expired() {
        state.workspaces.mark_invitation_expired(invitation.id).await?;
        return Err(ApiError::validation("Invitation has expired"));
    }

    let account = state
        .users
        .get_by_id(user.id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if !account.email.eq_ignore_ascii_case(&invitation.email) {
        warn!("❌ {} tried to accept invitation for {}", account.email, invitation.email);
        return Err(ApiError::forbidden(
            "This invitation was issued to a different email address",
        ));
    }

    let membership = state
        .workspaces
        .accept_invitation(&invitation, user.id)
        .await?;
    Ok(Json(membership))
}
