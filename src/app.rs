//! Application state and HTTP router.

use crate::auth::{self, auth_middleware, JwtHandler, UserStore};
use crate::automation::{self, CampaignStore, Dispatcher};
use crate::billing::{self, UsageTracker};
use crate::config::{Config, CALLBACK_PATH, WEBHOOK_PATH};
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::health::health_check;
use crate::integrations::{self, ConnectionStore, InstagramProvider, OAuthStateStore};
use crate::middleware::{
    rate_limit_middleware, request_id_middleware, request_logging, RateLimitConfig,
    RateLimitLayer,
};
use crate::workspace::{self, WorkspaceStore};
use axum::{
    http::HeaderValue,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

/// Everything a handler needs, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub jwt: Arc<JwtHandler>,
    pub users: UserStore,
    pub workspaces: WorkspaceStore,
    pub usage: UsageTracker,
    pub connections: ConnectionStore,
    pub oauth_states: OAuthStateStore,
    pub campaigns: CampaignStore,
    pub dispatcher: Dispatcher,
    pub provider: Arc<dyn InstagramProvider>,
    pub rate_limiter: RateLimitLayer,
}

impl AppState {
    pub fn new(config: Config, db: Database, provider: Arc<dyn InstagramProvider>) -> Self {
        let jwt = Arc::new(JwtHandler::new(
            config.jwt_secret.clone(),
            config.access_token_minutes,
            config.refresh_token_days,
        ));
        let cipher = TokenCipher::from_secret(&config.secret_key);
        let rate_limiter = RateLimitLayer::new(RateLimitConfig::per_minute(
            config.rate_limit_per_minute,
            config.rate_limit_burst,
        ));

        let usage = UsageTracker::new(db.clone());
        let connections = ConnectionStore::new(db.clone(), cipher);
        let campaigns = CampaignStore::new(db.clone());
        let dispatcher = Dispatcher::new(
            campaigns.clone(),
            connections.clone(),
            usage.clone(),
            provider.clone(),
        );

        Self {
            jwt,
            users: UserStore::new(db.clone(), config.bcrypt_cost),
            workspaces: WorkspaceStore::new(db.clone()),
            usage,
            connections,
            oauth_states: OAuthStateStore::new(db.clone()),
            campaigns,
            dispatcher,
            provider,
            rate_limiter,
            db,
            config: Arc::new(config),
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️  Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/v1/healthz", get(health_check))
        .route("/api/v1/auth/register", post(auth::api::register))
        .route("/api/v1/auth/login", post(auth::api::login))
        .route("/api/v1/auth/token/refresh", post(auth::api::refresh_token))
        .route(CALLBACK_PATH, get(integrations::api::connect_callback))
        .route(
            WEBHOOK_PATH,
            get(automation::webhook::verify_subscription).post(automation::webhook::receive_event),
        );

    let protected_routes = Router::new()
        .route(
            "/api/v1/auth/me",
            get(auth::api::me).patch(auth::api::update_me),
        )
        // Workspaces
        .route(
            "/api/v1/workspaces",
            get(workspace::api::list_workspaces).post(workspace::api::create_workspace),
        )
        .route(
            "/api/v1/workspaces/:id",
            get(workspace::api::get_workspace)
                .patch(workspace::api::update_workspace)
                .delete(workspace::api::delete_workspace),
        )
        .route(
            "/api/v1/workspaces/:id/members",
            get(workspace::api::list_members).post(workspace::api::add_member),
        )
        .route(
            "/api/v1/workspaces/:id/members/:membership_id/update_role",
            patch(workspace::api::update_member_role),
        )
        .route(
            "/api/v1/workspaces/:id/members/:membership_id/remove",
            delete(workspace::api::remove_member),
        )
        .route(
            "/api/v1/workspaces/:id/invitations",
            get(workspace::api::list_invitations).post(workspace::api::create_invitation),
        )
        .route(
            "/api/v1/invitations/accept",
            post(workspace::api::accept_invitation),
        )
        // Billing
        .route(
            "/api/v1/billing/workspaces/:workspace_id/plan",
            get(billing::api::get_plan).patch(billing::api::update_plan),
        )
        .route(
            "/api/v1/billing/workspaces/:workspace_id/usage",
            get(billing::api::get_usage),
        )
        .route(
            "/api/v1/billing/workspaces/:workspace_id/usage/history",
            get(billing::api::usage_history),
        )
        .route(
            "/api/v1/billing/workspaces/:workspace_id/test-increment",
            post(billing::api::test_increment),
        )
        // Instagram
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/connect/start",
            post(integrations::api::connect_start),
        )
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/connections",
            get(integrations::api::list_connections),
        )
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/connections/:connection_id",
            delete(integrations::api::disconnect),
        )
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/connections/:connection_id/verify",
            post(integrations::api::verify_connection),
        )
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/media",
            get(integrations::api::list_media),
        )
        .route(
            "/api/v1/integrations/instagram/workspaces/:workspace_id/media/:media_id",
            get(integrations::api::media_detail),
        )
        // Auto-DM campaigns
        .route(
            "/api/v1/integrations/auto-dm-campaigns",
            get(automation::api::list_campaigns).post(automation::api::create_campaign),
        )
        .route(
            "/api/v1/integrations/auto-dm-campaigns/:campaign_id",
            get(automation::api::get_campaign)
                .put(automation::api::replace_campaign)
                .patch(automation::api::update_campaign)
                .delete(automation::api::delete_campaign),
        )
        .route(
            "/api/v1/integrations/auto-dm-campaigns/:campaign_id/pause",
            post(automation::api::pause_campaign),
        )
        .route(
            "/api/v1/integrations/auto-dm-campaigns/:campaign_id/resume",
            post(automation::api::resume_campaign),
        )
        .route(
            "/api/v1/integrations/auto-dm-campaigns/:campaign_id/logs",
            get(automation::api::campaign_logs),
        )
        .route(
            "/api/v1/integrations/auto-dm-campaigns/:campaign_id/stats",
            get(automation::api::campaign_stats),
        )
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    let cors = cors_layer(&state.config);
    let limiter = state.rate_limiter.clone();

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(middleware::from_fn(request_logging))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
}

