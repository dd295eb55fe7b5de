//! Authentication API Endpoints
//! Mission: Registration, login, profile and token refresh

use crate::app::AppState;
use crate::auth::{
    middleware::AuthUser,
    models::{
        normalize_email, validate_password, AuthResponse, LoginRequest, RefreshRequest,
        RegisterRequest, TokenPair, UpdateProfileRequest, UserResponse,
    },
};
use crate::error::{ApiError, ApiResult};
use crate::workspace::store::insert_workspace;
use axum::{extract::State, http::StatusCode, Json};
use tracing::{info, warn};

const MAX_FULL_NAME_LENGTH: usize = 150;

/// Register endpoint - POST /api/v1/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let email = normalize_email(&payload.email)
        .ok_or_else(|| ApiError::validation("email: Enter a valid email address."))?;
    if payload.full_name.chars().count() > MAX_FULL_NAME_LENGTH {
        return Err(ApiError::validation(format!(
            "full_name: Ensure this field has no more than {MAX_FULL_NAME_LENGTH} characters."
        )));
    }
    if payload.password != payload.password_confirm {
        return Err(ApiError::validation("password: Password fields didn't match."));
    }
    validate_password(&payload.password).map_err(|e| ApiError::validation(format!("password: {e}")))?;

    if state.users.get_by_email(&email).await?.is_some() {
        return Err(ApiError::validation("email: A user with this email already exists."));
    }

    // The first workspace is created with the account
    let user = state
        .users
        .create_with(&email, &payload.full_name, &payload.password, |tx, user| {
            let name = format!("{}'s Workspace", user.display_name());
            insert_workspace(tx, &name, "", user.id).map(|_| ())
        })
        .await?
        .ok_or_else(|| ApiError::validation("email: A user with this email already exists."))?;

    let tokens = state.jwt.issue_pair(&user)?;
    info!("✅ Registered user: {}", user.email);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user: UserResponse::from(&user),
            tokens,
        }),
    ))
}

/// Login endpoint - POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let (Some(raw_email), Some(password)) = (payload.email, payload.password) else {
        return Err(ApiError::validation("Email and password are required"));
    };
    let email = normalize_email(&raw_email).unwrap_or_else(|| raw_email.trim().to_string());

    info!("🔐 Login attempt: {}", email);

    let Some(mut user) = state.users.verify_credentials(&email, &password).await? else {
        warn!("❌ Failed login attempt: {}", email);
        return Err(ApiError::InvalidCredentials);
    };

    state.users.touch_last_login(user.id).await?;
    if let Some(reloaded) = state.users.get_by_id(user.id).await? {
        user = reloaded;
    }

    let tokens = state.jwt.issue_pair(&user)?;
    info!("✅ Login successful: {}", user.email);

    Ok(Json(AuthResponse {
        user: UserResponse::from(&user),
        tokens,
    }))
}

/// Current user - GET /api/v1/auth/me
pub async fn me(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<UserResponse>> {
    let account = state
        .users
        .get_by_id(user.id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(UserResponse::from(&account)))
}

/// Update profile - PATCH /api/v1/auth/me
pub async fn update_me(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> ApiResult<Json<UserResponse>> {
    let account = match payload.full_name {
        Some(full_name) => {
            if full_name.chars().count() > MAX_FULL_NAME_LENGTH {
                return Err(ApiError::validation(format!(
                    "full_name: Ensure this field has no more than {MAX_FULL_NAME_LENGTH} characters."
                )));
            }
            state.users.update_full_name(user.id, &full_name).await?
        }
        None => state.users.get_by_id(user.id).await?,
    };
    let account = account.ok_or(ApiError::Unauthorized)?;
    Ok(Json(UserResponse::from(&account)))
}

/// Token refresh - POST /api/v1/auth/token/refresh
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let pair = state.jwt.refresh(&payload.refresh).map_err(|e| {
        warn!("❌ Refresh rejected: {e}");
        ApiError::Unauthorized
    })?;
    Ok(Json(pair))
}
