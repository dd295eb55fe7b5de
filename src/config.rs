//! Runtime configuration.
//!
//! Every setting can come from the command line or the environment (a `.env`
//! file is loaded first by the binary).

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "instaflow", about = "Instagram business automation backend")]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: String,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "instaflow.db")]
    pub database_path: String,

    /// Server secret; the access-token encryption key is derived from it
    #[arg(
        long,
        env = "SECRET_KEY",
        default_value = "dev-secret-change-in-production-minimum-32-characters",
        hide_env_values = true
    )]
    pub secret_key: String,

    /// HMAC secret for issued JWTs
    #[arg(
        long,
        env = "JWT_SECRET",
        default_value = "dev-jwt-secret-change-in-production",
        hide_env_values = true
    )]
    pub jwt_secret: String,

    #[arg(long, env = "ACCESS_TOKEN_MINUTES", default_value_t = 60)]
    pub access_token_minutes: i64,

    #[arg(long, env = "REFRESH_TOKEN_DAYS", default_value_t = 7)]
    pub refresh_token_days: i64,

    /// bcrypt work factor (4..=31)
    #[arg(long, env = "BCRYPT_COST", default_value_t = bcrypt::DEFAULT_COST)]
    pub bcrypt_cost: u32,

    #[arg(long, env = "META_APP_ID", default_value = "")]
    pub meta_app_id: String,

    #[arg(long, env = "META_APP_SECRET", default_value = "", hide_env_values = true)]
    pub meta_app_secret: String,

    /// OAuth redirect URI registered with Meta. Derived from PUBLIC_BASE_URL when empty.
    #[arg(long, env = "INSTAGRAM_REDIRECT_URI", default_value = "")]
    pub instagram_redirect_uri: String,

    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "http://localhost:8000")]
    pub public_base_url: String,

    /// Token Meta echoes back when subscribing the webhook; empty rejects every subscription
    #[arg(
        long,
        env = "INSTAGRAM_WEBHOOK_VERIFY_TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    pub instagram_webhook_verify_token: String,

    /// Use the built-in mock Instagram provider instead of the Graph API
    #[arg(
        long,
        env = "INSTAGRAM_MOCK_MODE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub instagram_mock_mode: bool,

    /// Comma separated list; empty allows any origin
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", value_delimiter = ',', default_value = "")]
    pub cors_allowed_origins: Vec<String>,

    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 100)]
    pub rate_limit_per_minute: u32,

    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub rate_limit_burst: u32,

    /// Interval of the expired-connection sweep, in seconds
    #[arg(long, env = "CONNECTION_SWEEP_SECS", default_value_t = 3600)]
    pub connection_sweep_secs: u64,
}

pub const CALLBACK_PATH: &str = "/api/v1/integrations/instagram/connect/callback";
pub const WEBHOOK_PATH: &str = "/api/v1/integrations/instagram/webhook";

impl Config {
    pub fn redirect_uri(&self) -> String {
        if !self.instagram_redirect_uri.trim().is_empty() {
            return self.instagram_redirect_uri.trim().to_string();
        }
        format!("{}{}", self.public_base_url.trim_end_matches('/'), CALLBACK_PATH)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }

    pub fn connection_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.connection_sweep_secs.max(1))
    }

    /// Verify token for the webhook subscription handshake, if one is configured
    pub fn webhook_verify_token(&self) -> Option<&str> {
        Some(self.instagram_webhook_verify_token.trim()).filter(|t| !t.is_empty())
    }
}
