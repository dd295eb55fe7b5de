//! Instagram Integration API Endpoints
//! Mission: Link, list, verify and revoke Instagram business accounts

use crate::app::AppState;
use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::integrations::{
    callback::{self, CallbackOutcome},
    models::{
        parse_limit, AccountSummary, CallbackQuery, CommentList, ConnectStartResponse,
        ConnectionResponse, ConnectionStatus, IgAccountConnection, MediaDetailResponse,
        MediaListQueryEcho, MediaListResponse, MediaQuery, DEFAULT_MEDIA_LIMIT, MAX_MEDIA_LIMIT,
    },
    store::PendingConnect,
};
use crate::workspace::member_access_or_forbidden;
use axum::{
    extract::{Path, Query, State},
    response::Html,
    Json,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// POST /api/v1/integrations/instagram/workspaces/:workspace_id/connect/start
pub async fn connect_start(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<ConnectStartResponse>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;

    let oauth_state = state.oauth_states.issue(workspace_id, user.id).await?;
    let authorization_url = state
        .provider
        .authorization_url(&state.config.redirect_uri(), &oauth_state)?;

    info!(
        "📸 Instagram connect started for workspace {} ({} mode)",
        workspace_id,
        state.provider.mode()
    );
    Ok(Json(ConnectStartResponse {
        authorization_url,
        state: oauth_state,
        mode: state.provider.mode(),
    }))
}

async fn complete_connect(
    state: &AppState,
    query: CallbackQuery,
) -> CallbackOutcome {
    if let Some(err) = query.error {
        let detail = query.error_description.unwrap_or_default();
        warn!("❌ OAuth denied: {} {}", err, detail);
        return CallbackOutcome::failed(
            "OAUTH_AUTHORIZATION_FAILED",
            format!("OAuth authorization failed: {err}"),
        );
    }

    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return CallbackOutcome::failed("MISSING_PARAMETERS", "Required parameters are missing.");
    };

    let pending: PendingConnect = match state.oauth_states.consume(&oauth_state).await {
        Ok(Some(pending)) => pending,
        Ok(None) => {
            return CallbackOutcome::failed(
                "INVALID_STATE",
                "The session has expired or the request is invalid. Please try again.",
            )
        }
        Err(e) => {
            error!("oauth state lookup failed: {e:#}");
            return CallbackOutcome::failed("INTERNAL_ERROR", "An internal error occurred.");
        }
    };

    let account = match state
        .provider
        .link_account(&code, &state.config.redirect_uri())
        .await
    {
        Ok(account) => account,
        Err(e) => {
            warn!("❌ Instagram link failed for workspace {}: {}", pending.workspace_id, e);
            return CallbackOutcome::failed(e.code(), e.to_string());
        }
    };

    match state.connections.upsert(pending.workspace_id, &account).await {
        Ok(connection) => {
            info!(
                "✅ Instagram @{} connected by user {}",
                connection.username, pending.user_id
            );
            CallbackOutcome::Connected(ConnectionResponse::from(connection))
        }
        Err(e) => {
            error!("storing connection failed: {e:#}");
            CallbackOutcome::failed("INTERNAL_ERROR", "An internal error occurred.")
        }
    }
}

/// GET /api/v1/integrations/instagram/connect/callback (public)
pub async fn connect_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Html<String> {
    let outcome = complete_connect(&state, query).await;
    Html(callback::render(&outcome))
}

/// GET /api/v1/integrations/instagram/workspaces/:workspace_id/connections
pub async fn list_connections(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ConnectionResponse>>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    let connections = state.connections.list(workspace_id).await?;
    Ok(Json(connections.into_iter().map(ConnectionResponse::from).collect()))
}

/// POST /api/v1/integrations/instagram/workspaces/:workspace_id/connections/:connection_id/verify
pub async fn verify_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, connection_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<ConnectionResponse>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id).await?;
    let connection = state
        .connections
        .get(workspace_id, connection_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Connection not found"))?;

    if connection.status == ConnectionStatus::Revoked {
        return Err(ApiError::validation("Connection has been revoked"));
    }
    if connection.is_expired() {
        let updated = state
            .connections
            .set_status(connection.id, ConnectionStatus::Expired, "Access token expired")
            .await?;
        return Ok(Json(ConnectionResponse::from(updated)));
    }

    let token = state.connections.access_token(&connection)?;
    let updated = match state
        .provider
        .verify_account(&connection.external_account_id, &token)
        .await
    {
        Ok(()) => state.connections.mark_verified(connection.id).await?,
        Err(e) => {
            warn!("❌ Verification failed for connection {}: {}", connection.id, e);
            state
                .connections
                .set_status(connection.id, ConnectionStatus::Error, &e.to_string())
                .await?
        }
    };
    Ok(Json(ConnectionResponse::from(updated)))
}

/// DELETE /api/v1/integrations/instagram/workspaces/:workspace_id/connections/:connection_id
pub async fn disconnect(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, connection_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<ConnectionResponse>> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user.id)
        .await?
        .require_admin()?;

    state
        .connections
        .get(workspace_id, connection_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Connection not found"))?;

    let revoked = state.connections.revoke(connection_id).await?;
    Ok(Json(ConnectionResponse::from(revoked)))
}

/// Active connection of a workspace the caller belongs to, with its plaintext token
async fn active_account(
    state: &AppState,
    workspace_id: Uuid,
    user_id: Uuid,
) -> ApiResult<(IgAccountConnection, String)> {
    member_access_or_forbidden(&state.workspaces, workspace_id, user_id).await?;
    let connection = state
        .connections
        .active_for_workspace(workspace_id)
        .await?
        .ok_or_else(|| ApiError::not_found("No active Instagram connection for this workspace"))?;
    let token = state.connections.access_token(&connection)?;
    Ok((connection, token))
}

/// GET /api/v1/integrations/instagram/workspaces/:workspace_id/media
pub async fn list_media(
    State(state): State<AppState>,
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Query(query): Query<MediaQuery>,
) -> ApiResult<Json<MediaListResponse>> {
    let limit = parse_limit(query.limit.as_deref(), DEFAULT_MEDIA_LIMIT, MAX_MEDIA_LIMIT)
        .map_err(ApiError::Validation)?;
    let after = query.after.filter(|a| !a.is_empty());
    let (connection, token) = active_account(&state, workspace_id, user.id).await?;

    let page = state
        .provider
        .list_media(&connection.external_account_id, &token, limit, after.as_deref())
        .await?;
    Ok(Json(MediaListResponse {
        success: true,
        count: page.data.len(),
        data: page.data,
        paging: page.paging,
        connection: AccountSummary::from(&connection),
        query: MediaListQueryEcho { limit, after },
    }))
}

/// GET /api/v1/integrations/instagram/workspaces/:workspace_id/media/:media_id
pub async fn media_detail(
    State(state): State<AppState>,
    user: AuthUser,
    Path((workspace_id, media_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<MediaDetailResponse>> {
    let (connection, token) = active_account(&state, workspace_id, user.id).await?;
    let detail = state.provider.media_detail(&media_id, &token).await?;
    Ok(Json(MediaDetailResponse {
        success: true,
        media: detail.media,
        comments: CommentList {
            count: detail.comments.len(),
            data: detail.comments,
        },
        connection: AccountSummary::from(&connection),
    }))
}
