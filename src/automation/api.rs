//! Auto-DM Campaign API Endpoints
//! Mission: Manage comment-triggered DM campaigns and read their delivery log

use crate::app::AppState;
use crate::auth::middleware::AuthUser;
use crate::automation::models::{
    Campaign, CampaignCreateQuery, CampaignResponse, CampaignStats, CampaignStatus,
    CreateCampaignRequest, DmLog, LogsQuery, UpdateCampaignRequest, DEFAULT_LOG_LIMIT,
    MAX_LOG_LIMIT,
};
use crate::error::{parse_json, ApiError, ApiResult};
use crate::integrations::models::parse_limit;
use crate::workspace::member_access_or_forbidden;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;

/// Campaign the caller can see through one of their workspaces. Campaigns of
/// other tenants read as missing.
async fn visible_campaign(state: &AppState, id: Uuid, user_id: Uuid) -> ApiResult<Campaign> {
    let not_found = || ApiError::not_found("Campaign not found");
    let campaign = state.campaigns.get(id).await?.ok_or_else(not_found)?;
    state
        .workspaces
        .membership(campaign.workspace_id, user_id)
        .await?
        .ok_or_else(not_found)?;
    Ok(campaign)
}

/// GET /api/v1/integrations/auto-dm-campaigns
pub async fn list_campaigns(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<CampaignResponse>>> {
    let campaigns = state.campaigns.list_for_user(user.id).await?;
    Ok(Json(campaigns.into_iter().map(CampaignResponse::from).collect()))
}

/// POST /api/v1/integrations/auto-dm-campaigns?workspace_id=
pub async fn create_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<CampaignCreateQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<CampaignResponse>)> {
    let raw = query
        .workspace_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::validation("workspace_id query parameter is required"))?;
    let workspace_id = Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::validation("workspace_id must be a valid UUID"))?;
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;

    let request: CreateCampaignRequest = parse_json(&body)?;
    let draft = request.validate()?;

    let connection = state
        .connections
        .active_for_workspace(workspace_id)
        .await?
        .ok_or_else(|| {
            ApiError::validation("No active Instagram connection found for this workspace")
        })?;

    let campaign = state.campaigns.create(connection.id, &draft).await?;
    info!(
        "📨 User {} created campaign {} in workspace {}",
        user.id, campaign.id, workspace_id
    );
    Ok((StatusCode::CREATED, Json(CampaignResponse::from(campaign))))
}

/// GET /api/v1/integrations/auto-dm-campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = visible_campaign(&state, campaign_id, user.id).await?;
    Ok(Json(CampaignResponse::from(campaign)))
}

async fn save_changes(
    state: &AppState,
    campaign_id: Uuid,
    user_id: Uuid,
    body: &[u8],
    partial: bool,
) -> ApiResult<Json<CampaignResponse>> {
    let current = visible_campaign(state, campaign_id, user_id).await?;
    let request: UpdateCampaignRequest = parse_json(body)?;
    let draft = request.apply(&current, partial)?;
    let updated = state
        .campaigns
        .update(campaign_id, &draft)
        .await?
        .ok_or_else(|| ApiError::not_found("Campaign not found"))?;
    Ok(Json(CampaignResponse::from(updated)))
}

/// PUT /api/v1/integrations/auto-dm-campaigns/:campaign_id
pub async fn replace_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<CampaignResponse>> {
    save_changes(&state, campaign_id, user.id, &body, false).await
}

/// PATCH /api/v1/integrations/auto-dm-campaigns/:campaign_id
pub async fn update_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<CampaignResponse>> {
    save_changes(&state, campaign_id, user.id, &body, true).await
}

/// DELETE /api/v1/integrations/auto-dm-campaigns/:campaign_id
pub async fn delete_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    visible_campaign(&state, campaign_id, user.id).await?;
    state.campaigns.delete(campaign_id).await?;
    info!("🗑️  Campaign {} deleted by user {}", campaign_id, user.id);
    Ok(StatusCode::NO_CONTENT)
}

async fn switch_status(
    state: &AppState,
    campaign_id: Uuid,
    user_id: Uuid,
    status: CampaignStatus,
) -> ApiResult<Json<CampaignResponse>> {
    visible_campaign(state, campaign_id, user_id).await?;
    let updated = state
        .campaigns
        .set_status(campaign_id, status)
        .await?
        .ok_or_else(|| ApiError::not_found("Campaign not found"))?;
    Ok(Json(CampaignResponse::from(updated)))
}

/// POST /api/v1/integrations/auto-dm-campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    switch_status(&state, campaign_id, user.id, CampaignStatus::Paused).await
}

/// POST /api/v1/integrations/auto-dm-campaigns/:campaign_id/resume
pub async fn resume_campaign(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    switch_status(&state, campaign_id, user.id, CampaignStatus::Active).await
}

/// GET /api/v1/integrations/auto-dm-campaigns/:campaign_id/logs
pub async fn campaign_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<DmLog>>> {
    let limit = parse_limit(query.limit.as_deref(), DEFAULT_LOG_LIMIT, MAX_LOG_LIMIT)
        .map_err(ApiError::Validation)?;
    visible_campaign(&state, campaign_id, user.id).await?;
    Ok(Json(state.campaigns.logs(campaign_id, limit).await?))
}

/// GET /api/v1/integrations/auto-dm-campaigns/:campaign_id/stats
pub async fn campaign_stats(
    State(state): State<AppState>,
    user: AuthUser,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<CampaignStats>> {
    let campaign = visible_campaign(&state, campaign_id, user.id).await?;
    Ok(Json(state.campaigns.stats(&campaign).await?))
}
