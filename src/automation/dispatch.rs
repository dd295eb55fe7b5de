//! Comment to DM pipeline.
//!
//! For every active campaign on the commented post: dedupe on the comment,
//! honour the hourly cap, meter `dm_sent` against the plan, then ask the
//! provider to send the private reply. Every outcome is logged.

use crate::automation::models::{Campaign, CommentEvent, DmStatus};
use crate::automation::store::CampaignStore;
use crate::billing::{UsageError, UsageMetric, UsageTracker};
use crate::integrations::{ConnectionStatus, ConnectionStore, InstagramProvider};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const HOURLY_LIMIT_REASON: &str = "Hourly send limit reached";
pub const PLAN_LIMIT_REASON: &str = "Plan limit reached for dm_sent";
pub const CONNECTION_INACTIVE_CODE: &str = "CONNECTION_INACTIVE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed { code: String, reason: String },
    Skipped { reason: String },
    /// The comment was already handled for this campaign
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub campaign_id: Uuid,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

#[derive(Clone)]
pub struct Dispatcher {
    campaigns: CampaignStore,
    connections: ConnectionStore,
    usage: UsageTracker,
    provider: Arc<dyn InstagramProvider>,
}

impl Dispatcher {
    pub fn new(
        campaigns: CampaignStore,
        connections: ConnectionStore,
        usage: UsageTracker,
        provider: Arc<dyn InstagramProvider>,
    ) -> Self {
        Self {
            campaigns,
            connections,
            usage,
            provider,
        }
    }

    /// Handle one comment across every active campaign on its post
    pub async fn handle_comment(&self, event: &CommentEvent) -> Result<Vec<Delivery>> {
        let campaigns = self.campaigns.active_for_media(&event.media_id).await?;
        if campaigns.is_empty() {
            return Ok(Vec::new());
        }

        let mut deliveries = Vec::with_capacity(campaigns.len());
        let mut collected_by = HashSet::new();
        for campaign in &campaigns {
            let outcome = self.deliver(campaign, event).await?;
            if outcome != DeliveryOutcome::Duplicate {
                collected_by.insert(campaign.workspace_id);
            }
            deliveries.push(Delivery {
                campaign_id: campaign.id,
                outcome,
            });
        }

        // A comment counts once per workspace, and only the first time it is seen
        for workspace_id in collected_by {
            if let Err(e) = self
                .usage
                .increment_usage(workspace_id, UsageMetric::CommentsCollected, 1)
                .await
            {
                warn!("comment metering failed for {}: {}", workspace_id, e);
            }
        }
        Ok(deliveries)
    }

    async fn deliver(&self, campaign: &Campaign, event: &CommentEvent) -> Result<DeliveryOutcome> {
        if !campaign.can_send_more() {
            let logged = self
                .campaigns
                .open_log(campaign, event, DmStatus::Skipped, HOURLY_LIMIT_REASON)
                .await?;
            return Ok(match logged {
                Some(_) => {
                    warn!("⏳ Campaign {} hit its hourly cap", campaign.id);
                    DeliveryOutcome::Skipped {
                        reason: HOURLY_LIMIT_REASON.to_string(),
                    }
                }
                None => DeliveryOutcome::Duplicate,
            });
        }

        let Some(log) = self
            .campaigns
            .open_log(campaign, event, DmStatus::Pending, "")
            .await?
        else {
            return Ok(DeliveryOutcome::Duplicate);
        };

        let connection = self
            .connections
            .get(campaign.workspace_id, campaign.ig_connection_id)
            .await?
            .filter(|c| c.status == ConnectionStatus::Active);
        let Some(connection) = connection else {
            let reason = "Instagram connection is not active".to_string();
            self.campaigns
                .mark_failed(log.id, &reason, CONNECTION_INACTIVE_CODE)
                .await?;
            return Ok(DeliveryOutcome::Failed {
                code: CONNECTION_INACTIVE_CODE.to_string(),
                reason,
            });
        };

        match self
            .usage
            .check_and_increment(campaign.workspace_id, UsageMetric::DmSent, 1)
            .await
        {
            Ok(_) => {}
            Err(UsageError::LimitExceeded { .. }) => {
                self.campaigns.mark_skipped(log.id, PLAN_LIMIT_REASON).await?;
                return Ok(DeliveryOutcome::Skipped {
                    reason: PLAN_LIMIT_REASON.to_string(),
                });
            }
            Err(e) => {
                let reason = e.to_string();
                self.campaigns.mark_failed(log.id, &reason, "USAGE_ERROR").await?;
                return Ok(DeliveryOutcome::Failed {
                    code: "USAGE_ERROR".to_string(),
                    reason,
                });
            }
        }

        let token = self.connections.access_token(&connection)?;
        match self
            .provider
            .send_comment_reply(
                &connection.external_account_id,
                &event.comment_id,
                &campaign.message_template,
                &token,
            )
            .await
        {
            Ok(response) => {
                self.campaigns.mark_sent(log.id, &response).await?;
                info!(
                    "✅ DM sent for campaign {} to @{}",
                    campaign.id, event.from_username
                );
                Ok(DeliveryOutcome::Sent)
            }
            Err(e) => {
                warn!("❌ DM failed for campaign {}: {}", campaign.id, e);
                let reason = e.to_string();
                self.campaigns.mark_failed(log.id, &reason, e.code()).await?;
                Ok(DeliveryOutcome::Failed {
                    code: e.code().to_string(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserStore;
    use crate::automation::models::{CampaignDraft, CampaignStatus};
    use crate::billing::Plan;
    use crate::crypto::TokenCipher;
    use crate::db::Database;
    use crate::integrations::{models::LinkedAccount, MockProvider};
    use crate::workspace::WorkspaceStore;
    use chrono::{Duration, Utc};
    use serde_json::json;

    struct Fixture {
        dispatcher: Dispatcher,
        campaigns: CampaignStore,
        connections: ConnectionStore,
        usage: UsageTracker,
        workspaces: WorkspaceStore,
        workspace_id: Uuid,
        connection_id: Uuid,
    }

    async fn setup(token: &str) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let users = UserStore::new(db.clone(), 4);
        let workspaces = WorkspaceStore::new(db.clone());
        let connections = ConnectionStore::new(db.clone(), TokenCipher::from_secret("s"));
        let campaigns = CampaignStore::new(db.clone());
        let usage = UsageTracker::new(db.clone());

        let owner = users.create("o@example.com", "", "password123").await.unwrap().unwrap();
        let ws = workspaces.create("Shop", "", owner.id).await.unwrap();
        let connection = connections
            .upsert(
                ws.id,
                &LinkedAccount {
                    external_account_id: "ig_1".to_string(),
                    username: "shop".to_string(),
                    account_type: "BUSINESS".to_string(),
                    access_token: token.to_string(),
                    expires_at: Utc::now() + Duration::days(30),
                    scopes: vec![],
                    metadata: json!({}),
                },
            )
            .await
            .unwrap();

        Fixture {
            dispatcher: Dispatcher::new(
                campaigns.clone(),
                connections.clone(),
                usage.clone(),
                Arc::new(MockProvider),
            ),
            campaigns,
            connections,
            usage,
            workspaces,
            workspace_id: ws.id,
            connection_id: connection.id,
        }
    }

    async fn campaign(f: &Fixture, max_sends_per_hour: i64) -> Campaign {
        f.campaigns
            .create(
                f.connection_id,
                &CampaignDraft {
                    media_id: "178".to_string(),
                    media_url: None,
                    name: "Launch".to_string(),
                    description: String::new(),
                    message_template: "Link inside".to_string(),
                    status: CampaignStatus::Active,
                    max_sends_per_hour,
                },
            )
            .await
            .unwrap()
    }

    fn comment(id: &str) -> CommentEvent {
        CommentEvent::from_change_value(&json!({
            "id": id,
            "text": "link please",
            "from": { "id": "u-1", "username": "fan" },
            "media": { "id": "178" }
        }))
        .unwrap()
    }

    async fn dm_sent(f: &Fixture) -> i64 {
        f.usage.current_period(f.workspace_id).await.unwrap().dm_sent
    }

    #[tokio::test]
    async fn test_comment_is_delivered_once() {
        let f = setup("mock_token_abc").await;
        let c = campaign(&f, 200).await;

        let first = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome, DeliveryOutcome::Sent);

        let replay = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert_eq!(replay[0].outcome, DeliveryOutcome::Duplicate);

        let c = f.campaigns.get(c.id).await.unwrap().unwrap();
        assert_eq!(c.total_sent, 1);
        assert_eq!(dm_sent(&f).await, 1);
        let counter = f.usage.current_period(f.workspace_id).await.unwrap();
        assert_eq!(counter.comments_collected, 1);

        let logs = f.campaigns.logs(c.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DmStatus::Sent);
        assert!(logs[0].api_response["message_id"].is_string());
    }

    #[tokio::test]
    async fn test_unwatched_media_is_ignored() {
        let f = setup("mock_token_abc").await;
        campaign(&f, 200).await;
        let mut other = comment("c-1");
        other.media_id = "999".to_string();
        assert!(f.dispatcher.handle_comment(&other).await.unwrap().is_empty());
        assert_eq!(
            f.usage.current_period(f.workspace_id).await.unwrap().comments_collected,
            0
        );
    }

    #[tokio::test]
    async fn test_hourly_cap_skips() {
        let f = setup("mock_token_abc").await;
        campaign(&f, 1).await;

        let first = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert_eq!(first[0].outcome, DeliveryOutcome::Sent);

        let second = f.dispatcher.handle_comment(&comment("c-2")).await.unwrap();
        assert_eq!(
            second[0].outcome,
            DeliveryOutcome::Skipped {
                reason: HOURLY_LIMIT_REASON.to_string()
            }
        );
        assert_eq!(dm_sent(&f).await, 1);
    }

    #[tokio::test]
    async fn test_plan_limit_skips_without_sending() {
        let f = setup("mock_token_abc").await;
        let c = campaign(&f, 200).await;
        f.workspaces.set_plan(f.workspace_id, Plan::Starter).await.unwrap();
        let limit = Plan::Starter.limits().limit(UsageMetric::DmSent);
        f.usage
            .increment_usage(f.workspace_id, UsageMetric::DmSent, limit)
            .await
            .unwrap();

        let out = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert_eq!(
            out[0].outcome,
            DeliveryOutcome::Skipped {
                reason: PLAN_LIMIT_REASON.to_string()
            }
        );
        assert_eq!(dm_sent(&f).await, limit);

        let c = f.campaigns.get(c.id).await.unwrap().unwrap();
        assert_eq!((c.total_sent, c.total_failed), (0, 0));
        assert_eq!(f.campaigns.logs(c.id, 1).await.unwrap()[0].status, DmStatus::Skipped);
    }

    #[tokio::test]
    async fn test_provider_error_is_logged_as_failure() {
        let f = setup("real-but-expired").await;
        let c = campaign(&f, 200).await;

        let out = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert!(matches!(
            &out[0].outcome,
            DeliveryOutcome::Failed { code, .. } if code == "FACEBOOK_API_ERROR"
        ));

        let c = f.campaigns.get(c.id).await.unwrap().unwrap();
        assert_eq!(c.total_failed, 1);
        let log = &f.campaigns.logs(c.id, 1).await.unwrap()[0];
        assert_eq!(log.status, DmStatus::Failed);
        assert_eq!(log.error_code, "FACEBOOK_API_ERROR");
    }

    #[tokio::test]
    async fn test_revoked_connection_fails_delivery() {
        let f = setup("mock_token_abc").await;
        let c = campaign(&f, 200).await;
        f.connections.revoke(f.connection_id).await.unwrap();

        let out = f.dispatcher.handle_comment(&comment("c-1")).await.unwrap();
        assert!(matches!(
            &out[0].outcome,
            DeliveryOutcome::Failed { code, .. } if code == CONNECTION_INACTIVE_CODE
        ));
        assert_eq!(dm_sent(&f).await, 0);
        assert_eq!(f.campaigns.get(c.id).await.unwrap().unwrap().total_failed, 1);
    }

    #[tokio::test]
    async fn test_paused_campaign_is_not_triggered() {
        let f = setup("mock_token_abc").await;
        let c = campaign(&f, 200).await;
        f.campaigns.set_status(c.id, CampaignStatus::Paused).await.unwrap();

        assert!(f.dispatcher.handle_comment(&comment("c-1")).await.unwrap().is_empty());
    }
}
