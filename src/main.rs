//! InstaFlow Backend
//! Mission: Serve the multi-tenant Instagram automation API

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use instaflow_backend::{build_router, integrations, AppState, Config, Database};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::parse();
    info!("🚀 InstaFlow backend starting");

    if config.secret_key == config.jwt_secret {
        warn!("⚠️  SECRET_KEY and JWT_SECRET are identical; set them separately in production");
    }

    let db = Database::open(&config.database_path)?;
    let provider = integrations::provider_from_config(&config)?;
    let state = AppState::new(config, db, provider);

    // Expired connections + stale OAuth states
    tokio::spawn(integrations::connection_sweep_polling(
        state.connections.clone(),
        state.oauth_states.clone(),
        state.config.connection_sweep_interval(),
    ));

    // Rate limiter bookkeeping
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = interval(limiter.window().max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let removed = limiter.cleanup();
            if removed > 0 {
                info!("🧹 Rate limiter: dropped {} idle clients", removed);
            }
        }
    });

    let addr = state.config.bind_addr.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instaflow_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Crate-root .env when launched via --manifest-path from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
