//! Persistence for campaigns and their DM log.

use crate::automation::models::{
    Campaign, CampaignDraft, CampaignStats, CampaignStatus, CommentEvent, DmLog, DmStatus,
    StatusCounts, success_rate,
};
use crate::db::{self, Database};
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// `?1` is the start of the hourly window
const CAMPAIGN_SELECT: &str = "SELECT c.id, k.workspace_id, c.ig_connection_id, k.username, \
     c.media_id, c.media_url, c.name, c.description, c.message_template, c.status, \
     c.max_sends_per_hour, c.total_sent, c.total_failed, c.created_at, c.updated_at, \
     c.started_at, c.ended_at, \
     (SELECT COUNT(*) FROM sent_dm_logs l \
      WHERE l.campaign_id = c.id AND l.status != 'skipped' AND l.created_at >= ?1) \
     FROM auto_dm_campaigns c JOIN ig_account_connections k ON k.id = c.ig_connection_id";

const LOG_SELECT: &str = "SELECT l.id, l.campaign_id, c.name, l.comment_id, l.comment_text, \
     l.recipient_user_id, l.recipient_username, l.message_sent, l.status, l.error_message, \
     l.error_code, l.webhook_payload, l.api_response, l.created_at, l.sent_at \
     FROM sent_dm_logs l JOIN auto_dm_campaigns c ON c.id = l.campaign_id";

/// Keeps `started_at`/`ended_at` in step with a status change; `?1` status, `?2` now
const STATUS_TIMESTAMPS: &str = "
    started_at = CASE WHEN ?1 = 'active' THEN COALESCE(started_at, ?2) ELSE started_at END,
    ended_at = CASE WHEN ?1 = 'completed' THEN COALESCE(ended_at, ?2)
                    WHEN ?1 = 'active' THEN NULL
                    ELSE ended_at END";

fn hour_ago() -> String {
    db::ts(&(Utc::now() - Duration::hours(1)))
}

fn map_campaign(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let status: String = row.get(9)?;
    Ok(Campaign {
        id: db::uuid_col(row, 0)?,
        workspace_id: db::uuid_col(row, 1)?,
        ig_connection_id: db::uuid_col(row, 2)?,
        ig_username: row.get(3)?,
        media_id: row.get(4)?,
        media_url: row.get(5)?,
        name: row.get(6)?,
        description: row.get(7)?,
        message_template: row.get(8)?,
        status: status.parse().unwrap_or(CampaignStatus::Inactive),
        max_sends_per_hour: row.get(10)?,
        total_sent: row.get(11)?,
        total_failed: row.get(12)?,
        created_at: db::ts_col(row, 13)?,
        updated_at: db::ts_col(row, 14)?,
        started_at: db::opt_ts_col(row, 15)?,
        ended_at: db::opt_ts_col(row, 16)?,
        sends_last_hour: row.get(17)?,
    })
}

fn map_log(row: &Row<'_>) -> rusqlite::Result<DmLog> {
    let status: String = row.get(8)?;
    Ok(DmLog {
        id: db::uuid_col(row, 0)?,
        campaign_id: db::uuid_col(row, 1)?,
        campaign_name: row.get(2)?,
        comment_id: row.get(3)?,
        comment_text: row.get(4)?,
        recipient_user_id: row.get(5)?,
        recipient_username: row.get(6)?,
        message_sent: row.get(7)?,
        status: status.parse().unwrap_or(DmStatus::Failed),
        error_message: row.get(9)?,
        error_code: row.get(10)?,
        webhook_payload: db::json_col(row, 11)?,
        api_response: db::json_col(row, 12)?,
        created_at: db::ts_col(row, 13)?,
        sent_at: db::opt_ts_col(row, 14)?,
    })
}

fn load_campaign(conn: &Connection, id: Uuid) -> Result<Option<Campaign>> {
    let sql = format!("{CAMPAIGN_SELECT} WHERE c.id = ?2");
    conn.query_row(&sql, params![hour_ago(), id.to_string()], map_campaign)
        .optional()
        .context("Failed to load campaign")
}

fn load_log(conn: &Connection, id: Uuid) -> Result<Option<DmLog>> {
    let sql = format!("{LOG_SELECT} WHERE l.id = ?1");
    conn.query_row(&sql, params![id.to_string()], map_log)
        .optional()
        .context("Failed to load DM log")
}

/// Campaigns and the per-comment delivery log
#[derive(Clone)]
pub struct CampaignStore {
    db: Database,
}

impl CampaignStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, connection_id: Uuid, draft: &CampaignDraft) -> Result<Campaign> {
        let id = Uuid::new_v4();
        let now = db::now_ts();
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO auto_dm_campaigns
                (id, ig_connection_id, media_id, media_url, name, description, message_template,
                 status, max_sends_per_hour, total_sent, total_failed, created_at, updated_at,
                 started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?10, ?10, NULL)",
            params![
                id.to_string(),
                connection_id.to_string(),
                draft.media_id,
                draft.media_url,
                draft.name,
                draft.description,
                draft.message_template,
                draft.status.as_str(),
                draft.max_sends_per_hour,
                now,
            ],
        )
        .context("Failed to create campaign")?;

        let campaign = load_campaign(&conn, id)?.context("campaign vanished after insert")?;
        info!(
            "📨 Campaign '{}' created for media {} (@{})",
            campaign.name, campaign.media_id, campaign.ig_username
        );
        Ok(campaign)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Campaign>> {
        let conn = self.db.lock().await;
        load_campaign(&conn, id)
    }

    /// Campaigns of every workspace the user belongs to, newest first
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Campaign>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "{CAMPAIGN_SELECT}
             WHERE k.workspace_id IN (SELECT workspace_id FROM memberships WHERE user_id = ?2)
             ORDER BY c.created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let campaigns = stmt
            .query_map(params![hour_ago(), user_id.to_string()], map_campaign)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(campaigns)
    }

    /// Active campaigns listening on a post, oldest first
    pub async fn active_for_media(&self, media_id: &str) -> Result<Vec<Campaign>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "{CAMPAIGN_SELECT}
             WHERE c.media_id = ?2 AND c.status = 'active'
             ORDER BY c.created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let campaigns = stmt
            .query_map(params![hour_ago(), media_id], map_campaign)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(campaigns)
    }

    pub async fn update(&self, id: Uuid, draft: &CampaignDraft) -> Result<Option<Campaign>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "UPDATE auto_dm_campaigns SET
                status = ?1, updated_at = ?2, {STATUS_TIMESTAMPS},
                media_id = ?3, media_url = ?4, name = ?5, description = ?6,
                message_template = ?7, max_sends_per_hour = ?8
             WHERE id = ?9"
        );
        let changed = conn
            .execute(
                &sql,
                params![
                    draft.status.as_str(),
                    db::now_ts(),
                    draft.media_id,
                    draft.media_url,
                    draft.name,
                    draft.description,
                    draft.message_template,
                    draft.max_sends_per_hour,
                    id.to_string(),
                ],
            )
            .context("Failed to update campaign")?;
        if changed == 0 {
            return Ok(None);
        }
        load_campaign(&conn, id)
    }

    pub async fn set_status(&self, id: Uuid, status: CampaignStatus) -> Result<Option<Campaign>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "UPDATE auto_dm_campaigns SET status = ?1, updated_at = ?2, {STATUS_TIMESTAMPS}
             WHERE id = ?3"
        );
        let changed = conn
            .execute(&sql, params![status.as_str(), db::now_ts(), id.to_string()])
            .context("Failed to update campaign status")?;
        if changed == 0 {
            return Ok(None);
        }
        info!("📨 Campaign {} is now {}", id, status);
        load_campaign(&conn, id)
    }

    /// Deletes the campaign and its log
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.db.lock().await;
        let deleted = conn
            .execute("DELETE FROM auto_dm_campaigns WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete campaign")?;
        Ok(deleted > 0)
    }

    /// Newest first
    pub async fn logs(&self, campaign_id: Uuid, limit: u32) -> Result<Vec<DmLog>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "{LOG_SELECT} WHERE l.campaign_id = ?1
             ORDER BY l.created_at DESC, l.rowid DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params![campaign_id.to_string(), limit], map_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    pub async fn stats(&self, campaign: &Campaign) -> Result<CampaignStats> {
        let day_ago = db::ts(&(Utc::now() - Duration::hours(24)));
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM sent_dm_logs
             WHERE campaign_id = ?1 AND created_at >= ?2
             GROUP BY status",
        )?;
        let rows = stmt
            .query_map(params![campaign.id.to_string(), day_ago], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut last_24h = StatusCounts::default();
        for (status, count) in rows {
            last_24h.total += count;
            match status.parse::<DmStatus>() {
                Ok(DmStatus::Sent) => last_24h.sent += count,
                Ok(DmStatus::Failed) => last_24h.failed += count,
                Ok(DmStatus::Pending) => last_24h.pending += count,
                Ok(DmStatus::Skipped) => last_24h.skipped += count,
                Err(e) => debug!("ignoring log status in stats: {e}"),
            }
        }

        Ok(CampaignStats {
            total_sent: campaign.total_sent,
            total_failed: campaign.total_failed,
            success_rate: success_rate(campaign.total_sent, campaign.total_failed),
            last_24h,
            can_send_more: campaign.can_send_more(),
            status: campaign.status,
        })
    }

    /// Record the first sighting of a comment for a campaign. `None` when the
    /// comment already has a log row for it.
    pub async fn open_log(
        &self,
        campaign: &Campaign,
        event: &CommentEvent,
        status: DmStatus,
        error_message: &str,
    ) -> Result<Option<DmLog>> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&event.payload)?;
        let conn = self.db.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO sent_dm_logs
                    (id, campaign_id, comment_id, comment_text, recipient_user_id,
                     recipient_username, message_sent, status, error_message, error_code,
                     webhook_payload, api_response, created_at, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, '', ?10, '{}', ?11, NULL)
                 ON CONFLICT (campaign_id, comment_id) DO NOTHING",
                params![
                    id.to_string(),
                    campaign.id.to_string(),
                    event.comment_id,
                    event.text,
                    event.from_id,
                    event.from_username,
                    campaign.message_template,
                    status.as_str(),
                    error_message,
                    payload,
                    db::now_ts(),
                ],
            )
            .context("Failed to record DM log")?;
        if inserted == 0 {
            return Ok(None);
        }
        load_log(&conn, id)
    }

    pub async fn mark_sent(&self, log_id: Uuid, api_response: &Value) -> Result<DmLog> {
        let response = serde_json::to_string(api_response)?;
        let now = db::now_ts();
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sent_dm_logs SET status = 'sent', sent_at = ?1, api_response = ?2,
                error_message = '', error_code = ''
             WHERE id = ?3",
            params![now, response, log_id.to_string()],
        )?;
        tx.execute(
            "UPDATE auto_dm_campaigns SET total_sent = total_sent + 1, updated_at = ?1
             WHERE id = (SELECT campaign_id FROM sent_dm_logs WHERE id = ?2)",
            params![now, log_id.to_string()],
        )?;
        let log = load_log(&tx, log_id)?.context("DM log vanished")?;
        tx.commit()?;
        Ok(log)
    }

    pub async fn mark_failed(
        &self,
        log_id: Uuid,
        error_message: &str,
        error_code: &str,
    ) -> Result<DmLog> {
        let now = db::now_ts();
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sent_dm_logs SET status = 'failed', error_message = ?1, error_code = ?2
             WHERE id = ?3",
            params![error_message, error_code, log_id.to_string()],
        )?;
        tx.execute(
            "UPDATE auto_dm_campaigns SET total_failed = total_failed + 1, updated_at = ?1
             WHERE id = (SELECT campaign_id FROM sent_dm_logs WHERE id = ?2)",
            params![now, log_id.to_string()],
        )?;
        let log = load_log(&tx, log_id)?.context("DM log vanished")?;
        tx.commit()?;
        Ok(log)
    }

    /// Skipped attempts leave the campaign totals alone
    pub async fn mark_skipped(&self, log_id: Uuid, reason: &str) -> Result<DmLog> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE sent_dm_logs SET status = 'skipped', error_message = ?1 WHERE id = ?2",
            params![reason, log_id.to_string()],
        )?;
        load_log(&conn, log_id)?.context("DM log vanished")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserStore;
    use crate::crypto::TokenCipher;
    use crate::integrations::{models::LinkedAccount, ConnectionStore};
    use crate::workspace::{Role, WorkspaceStore};
    use serde_json::json;

    struct Fixture {
        store: CampaignStore,
        db: Database,
        connection_id: Uuid,
        owner: Uuid,
        member: Uuid,
        outsider: Uuid,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let users = UserStore::new(db.clone(), 4);
        let workspaces = WorkspaceStore::new(db.clone());
        let connections = ConnectionStore::new(db.clone(), TokenCipher::from_secret("s"));

        let owner = users.create("o@example.com", "", "password123").await.unwrap().unwrap();
        let member = users.create("m@example.com", "", "password123").await.unwrap().unwrap();
        let outsider = users.create("x@example.com", "", "password123").await.unwrap().unwrap();
        let ws = workspaces.create("Shop", "", owner.id).await.unwrap();
        workspaces.add_member(ws.id, member.id, Role::Member).await.unwrap();

        let connection = connections
            .upsert(
                ws.id,
                &LinkedAccount {
                    external_account_id: "ig_1".to_string(),
                    username: "shop".to_string(),
                    account_type: "BUSINESS".to_string(),
                    access_token: "mock_token_abc".to_string(),
                    expires_at: Utc::now() + Duration::days(30),
                    scopes: vec![],
                    metadata: json!({}),
                },
            )
            .await
            .unwrap();

        Fixture {
            store: CampaignStore::new(db.clone()),
            db,
            connection_id: connection.id,
            owner: owner.id,
            member: member.id,
            outsider: outsider.id,
        }
    }

    fn draft(media_id: &str, max_sends_per_hour: i64) -> CampaignDraft {
        CampaignDraft {
            media_id: media_id.to_string(),
            media_url: None,
            name: "Launch".to_string(),
            description: String::new(),
            message_template: "Here is your link".to_string(),
            status: CampaignStatus::Active,
            max_sends_per_hour,
        }
    }

    fn comment(id: &str) -> CommentEvent {
        CommentEvent {
            comment_id: id.to_string(),
            text: "link?".to_string(),
            from_id: "u-1".to_string(),
            from_username: "fan".to_string(),
            media_id: "178".to_string(),
            payload: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn test_create_and_visibility() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 200)).await.unwrap();
        assert_eq!(campaign.ig_username, "shop");
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert!(campaign.started_at.is_some());
        assert!(campaign.can_send_more());

        assert_eq!(f.store.list_for_user(f.owner).await.unwrap().len(), 1);
        assert_eq!(f.store.list_for_user(f.member).await.unwrap().len(), 1);
        assert!(f.store.list_for_user(f.outsider).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_changes_track_timestamps() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 200)).await.unwrap();

        let paused = f.store.set_status(campaign.id, CampaignStatus::Paused).await.unwrap().unwrap();
        assert_eq!(paused.status, CampaignStatus::Paused);
        assert!(f.store.active_for_media("178").await.unwrap().is_empty());

        let done = f.store.set_status(campaign.id, CampaignStatus::Completed).await.unwrap().unwrap();
        assert!(done.ended_at.is_some());

        let resumed = f.store.set_status(campaign.id, CampaignStatus::Active).await.unwrap().unwrap();
        assert!(resumed.ended_at.is_none());
        assert_eq!(resumed.started_at, campaign.started_at);
        assert_eq!(f.store.active_for_media("178").await.unwrap().len(), 1);

        assert!(f.store.set_status(Uuid::new_v4(), CampaignStatus::Paused).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_is_unique_per_comment() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 200)).await.unwrap();

        let log = f
            .store
            .open_log(&campaign, &comment("c-1"), DmStatus::Pending, "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, DmStatus::Pending);
        assert_eq!(log.message_sent, "Here is your link");
        assert_eq!(log.recipient_username, "fan");

        assert!(f
            .store
            .open_log(&campaign, &comment("c-1"), DmStatus::Pending, "")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_outcomes_update_totals_and_stats() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 2)).await.unwrap();

        let first = f.store.open_log(&campaign, &comment("c-1"), DmStatus::Pending, "").await.unwrap().unwrap();
        let sent = f.store.mark_sent(first.id, &json!({ "message_id": "m1" })).await.unwrap();
        assert_eq!(sent.status, DmStatus::Sent);
        assert!(sent.sent_at.is_some());
        assert_eq!(sent.api_response["message_id"], "m1");

        let second = f.store.open_log(&campaign, &comment("c-2"), DmStatus::Pending, "").await.unwrap().unwrap();
        let failed = f.store.mark_failed(second.id, "token expired", "FACEBOOK_API_ERROR").await.unwrap();
        assert_eq!(failed.error_code, "FACEBOOK_API_ERROR");

        f.store
            .open_log(&campaign, &comment("c-3"), DmStatus::Skipped, "Hourly send limit reached")
            .await
            .unwrap();

        let campaign = f.store.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.total_sent, 1);
        assert_eq!(campaign.total_failed, 1);
        // Two attempts against a cap of two; the skipped row does not count
        assert_eq!(campaign.sends_last_hour, 2);
        assert!(!campaign.can_send_more());

        let stats = f.store.stats(&campaign).await.unwrap();
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(
            stats.last_24h,
            StatusCounts { total: 3, sent: 1, failed: 1, pending: 0, skipped: 1 }
        );

        let logs = f.store.logs(campaign.id, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].comment_id, "c-3");
        assert_eq!(logs[0].campaign_name, "Launch");
    }

    #[tokio::test]
    async fn test_old_attempts_leave_the_hourly_window() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 1)).await.unwrap();
        f.store.open_log(&campaign, &comment("c-1"), DmStatus::Pending, "").await.unwrap();
        assert!(!f.store.get(campaign.id).await.unwrap().unwrap().can_send_more());

        {
            let conn = f.db.lock().await;
            conn.execute(
                "UPDATE sent_dm_logs SET created_at = ?1",
                params![db::ts(&(Utc::now() - Duration::minutes(61)))],
            )
            .unwrap();
        }
        assert!(f.store.get(campaign.id).await.unwrap().unwrap().can_send_more());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_logs() {
        let f = setup().await;
        let campaign = f.store.create(f.connection_id, &draft("178", 200)).await.unwrap();
        f.store.open_log(&campaign, &comment("c-1"), DmStatus::Pending, "").await.unwrap();

        assert!(f.store.delete(campaign.id).await.unwrap());
        assert!(!f.store.delete(campaign.id).await.unwrap());

        let conn = f.db.lock().await;
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM sent_dm_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
