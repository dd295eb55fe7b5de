//! Integrations Module
//! Mission: Link Instagram business accounts through OAuth and keep their tokens safe

pub mod api;
pub mod callback;
pub mod models;
pub mod oauth;
pub mod store;

pub use models::{ConnectionStatus, IgAccountConnection};
pub use oauth::{GraphApiProvider, InstagramProvider, MockProvider};
pub use store::{ConnectionStore, OAuthStateStore};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

/// One maintenance pass: flag expired connections, drop stale OAuth states.
/// Returns (connections expired, states purged).
pub async fn sweep(connections: &ConnectionStore, states: &OAuthStateStore) -> Result<(usize, usize)> {
    let expired = connections.expire_stale().await?;
    let purged = states.purge_expired().await?;
    Ok((expired, purged))
}

/// Run [`sweep`] forever at the given period
pub async fn connection_sweep_polling(
    connections: ConnectionStore,
    states: OAuthStateStore,
    period: Duration,
) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        match sweep(&connections, &states).await {
            Ok((expired, purged)) => {
                if expired > 0 || purged > 0 {
                    info!(
                        "🧹 Connection sweep: {} expired, {} oauth states purged",
                        expired, purged
                    );
                }
            }
            Err(e) => warn!("connection sweep failed: {}", e),
        }
    }
}

/// Provider selected by configuration
pub fn provider_from_config(config: &crate::config::Config) -> Result<Arc<dyn InstagramProvider>> {
    if config.instagram_mock_mode {
        info!("📸 Instagram provider: mock");
        Ok(Arc::new(MockProvider))
    } else {
        if config.meta_app_id.is_empty() || config.meta_app_secret.is_empty() {
            warn!("⚠️  META_APP_ID / META_APP_SECRET not set; Graph API calls will fail");
        }
        info!("📸 Instagram provider: Graph API {}", oauth::GRAPH_API_VERSION);
        Ok(Arc::new(GraphApiProvider::new(
            config.meta_app_id.clone(),
            config.meta_app_secret.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::TokenCipher;
    use crate::db::Database;
    use clap::Parser;

    #[tokio::test]
    async fn test_sweep_on_empty_database() {
        let db = Database::open_in_memory().unwrap();
        let connections = ConnectionStore::new(db.clone(), TokenCipher::from_secret("s"));
        let states = OAuthStateStore::new(db);
        assert_eq!(sweep(&connections, &states).await.unwrap(), (0, 0));
    }

    #[test]
    fn test_provider_selection() {
        let mock = Config::parse_from(["instaflow"]);
        assert_eq!(provider_from_config(&mock).unwrap().mode(), "mock");

        let real = Config::parse_from(["instaflow", "--instagram-mock-mode", "false"]);
        assert_eq!(provider_from_config(&real).unwrap().mode(), "production");
    }
}
