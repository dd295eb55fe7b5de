//! Persistence for account connections and pending OAuth states.

use crate::crypto::{self, TokenCipher};
use crate::db::{self, Database};
use crate::integrations::models::{ConnectionStatus, IgAccountConnection, LinkedAccount};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// How long a connect attempt may take before its state is rejected
pub const OAUTH_STATE_TTL_MINUTES: i64 = 10;

const CONNECTION_COLUMNS: &str = "id, workspace_id, external_account_id, username, account_type, \
     encrypted_access_token, token_expires_at, scopes, status, last_verified_at, error_message, \
     metadata, created_at, updated_at";

fn map_connection(row: &Row<'_>) -> rusqlite::Result<IgAccountConnection> {
    let status: String = row.get(8)?;
    Ok(IgAccountConnection {
        id: db::uuid_col(row, 0)?,
        workspace_id: db::uuid_col(row, 1)?,
        external_account_id: row.get(2)?,
        username: row.get(3)?,
        account_type: row.get(4)?,
        encrypted_access_token: row.get(5)?,
        token_expires_at: db::opt_ts_col(row, 6)?,
        scopes: db::json_col(row, 7)?,
        status: status.parse().unwrap_or(ConnectionStatus::Error),
        last_verified_at: db::opt_ts_col(row, 9)?,
        error_message: row.get(10)?,
        metadata: db::json_col(row, 11)?,
        created_at: db::ts_col(row, 12)?,
        updated_at: db::ts_col(row, 13)?,
    })
}

fn load_connection(conn: &Connection, id: Uuid) -> Result<Option<IgAccountConnection>> {
    let sql = format!("SELECT {CONNECTION_COLUMNS} FROM ig_account_connections WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], map_connection)
        .optional()
        .context("Failed to load connection")
}

/// Account connections with tokens encrypted at rest
#[derive(Clone)]
pub struct ConnectionStore {
    db: Database,
    cipher: TokenCipher,
}

impl ConnectionStore {
    pub fn new(db: Database, cipher: TokenCipher) -> Self {
        Self { db, cipher }
    }

    /// Insert or refresh the connection for (workspace, external account).
    /// The result is active and freshly verified.
    pub async fn upsert(
        &self,
        workspace_id: Uuid,
        account: &LinkedAccount,
    ) -> Result<IgAccountConnection> {
        let encrypted = self.cipher.encrypt(&account.access_token)?;
        let scopes = serde_json::to_string(&account.scopes)?;
        let metadata = serde_json::to_string(&account.metadata)?;
        let now = db::now_ts();

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO ig_account_connections
                (id, workspace_id, external_account_id, username, account_type,
                 encrypted_access_token, token_expires_at, scopes, status, last_verified_at,
                 error_message, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, '', ?10, ?9, ?9)
             ON CONFLICT (workspace_id, external_account_id) DO UPDATE SET
                username = excluded.username,
                account_type = excluded.account_type,
                encrypted_access_token = excluded.encrypted_access_token,
                token_expires_at = excluded.token_expires_at,
                scopes = excluded.scopes,
                status = 'active',
                last_verified_at = excluded.last_verified_at,
                error_message = '',
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                workspace_id.to_string(),
                account.external_account_id,
                account.username,
                account.account_type,
                encrypted,
                db::ts(&account.expires_at),
                scopes,
                now,
                metadata,
            ],
        )
        .context("Failed to upsert connection")?;

        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM ig_account_connections
             WHERE workspace_id = ?1 AND external_account_id = ?2"
        );
        let connection = conn
            .query_row(
                &sql,
                params![workspace_id.to_string(), account.external_account_id],
                map_connection,
            )
            .context("Failed to reload connection")?;

        info!(
            "📸 Instagram account @{} linked to workspace {}",
            connection.username, workspace_id
        );
        Ok(connection)
    }

    pub async fn list(&self, workspace_id: Uuid) -> Result<Vec<IgAccountConnection>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM ig_account_connections
             WHERE workspace_id = ?1 ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let connections = stmt
            .query_map(params![workspace_id.to_string()], map_connection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(connections)
    }

    /// Connection scoped to its workspace
    pub async fn get(&self, workspace_id: Uuid, id: Uuid) -> Result<Option<IgAccountConnection>> {
        let conn = self.db.lock().await;
        Ok(load_connection(&conn, id)?.filter(|c| c.workspace_id == workspace_id))
    }

    /// Most recently linked active connection of a workspace
    pub async fn active_for_workspace(&self, workspace_id: Uuid) -> Result<Option<IgAccountConnection>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {CONNECTION_COLUMNS} FROM ig_account_connections
             WHERE workspace_id = ?1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1"
        );
        conn.query_row(&sql, params![workspace_id.to_string()], map_connection)
            .optional()
            .context("Failed to load active connection")
    }

    /// Plaintext access token of a connection
    pub fn access_token(&self, connection: &IgAccountConnection) -> Result<String> {
        self.cipher.decrypt(&connection.encrypted_access_token)
    }

    pub async fn set_status(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        error_message: &str,
    ) -> Result<IgAccountConnection> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE ig_account_connections
             SET status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), error_message, db::now_ts(), id.to_string()],
        )
        .context("Failed to update connection status")?;
        load_connection(&conn, id)?.ok_or_else(|| anyhow!("connection {id} not found"))
    }

    pub async fn mark_verified(&self, id: Uuid) -> Result<IgAccountConnection> {
        let conn = self.db.lock().await;
        let now = db::now_ts();
        conn.execute(
            "UPDATE ig_account_connections
             SET status = 'active', error_message = '', last_verified_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, id.to_string()],
        )
        .context("Failed to mark connection verified")?;
        load_connection(&conn, id)?.ok_or_else(|| anyhow!("connection {id} not found"))
    }

    /// Revoke a connection and wipe its stored token
    pub async fn revoke(&self, id: Uuid) -> Result<IgAccountConnection> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE ig_account_connections
             SET status = 'revoked', encrypted_access_token = '', updated_at = ?1
             WHERE id = ?2",
            params![db::now_ts(), id.to_string()],
        )
        .context("Failed to revoke connection")?;
        info!("🔌 Instagram connection {} revoked", id);
        load_connection(&conn, id)?.ok_or_else(|| anyhow!("connection {id} not found"))
    }

    /// Flag active connections whose token expiry has passed
    pub async fn expire_stale(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        let now = db::now_ts();
        let updated = conn
            .execute(
                "UPDATE ig_account_connections
                 SET status = 'expired', updated_at = ?1
                 WHERE status = 'active' AND token_expires_at IS NOT NULL AND token_expires_at <= ?1",
                params![now],
            )
            .context("Failed to expire connections")?;
        Ok(updated)
    }
}

/// Pending OAuth attempt, resolved from the `state` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConnect {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
}

/// Single-use OAuth `state` values
#[derive(Clone)]
pub struct OAuthStateStore {
    db: Database,
}

impl OAuthStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn issue(&self, workspace_id: Uuid, user_id: Uuid) -> Result<String> {
        let state = crypto::random_token(32);
        let expires_at = Utc::now() + Duration::minutes(OAUTH_STATE_TTL_MINUTES);

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO oauth_states (state, workspace_id, user_id, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                state,
                workspace_id.to_string(),
                user_id.to_string(),
                db::ts(&expires_at)
            ],
        )
        .context("Failed to store OAuth state")?;
        debug!(%workspace_id, "oauth state issued");
        Ok(state)
    }

    /// Remove the state and return its attempt if it had not expired
    pub async fn consume(&self, state: &str) -> Result<Option<PendingConnect>> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT workspace_id, user_id, expires_at FROM oauth_states WHERE state = ?1",
                params![state],
                |row| {
                    Ok((
                        db::uuid_col(row, 0)?,
                        db::uuid_col(row, 1)?,
                        db::ts_col(row, 2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to load OAuth state")?;
        tx.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])?;
        tx.commit()?;

        Ok(row.and_then(|(workspace_id, user_id, expires_at)| {
            (expires_at > Utc::now()).then_some(PendingConnect {
                workspace_id,
                user_id,
            })
        }))
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        let purged = conn
            .execute(
                "DELETE FROM oauth_states WHERE expires_at <= ?1",
                params![db::now_ts()],
            )
            .context("Failed to purge OAuth states")?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserStore;
    use crate::workspace::WorkspaceStore;
    use serde_json::json;

    async fn setup() -> (ConnectionStore, OAuthStateStore, Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let users = UserStore::new(db.clone(), 4);
        let workspaces = WorkspaceStore::new(db.clone());
        let user = users.create("o@example.com", "", "password123").await.unwrap().unwrap();
        let ws = workspaces.create("IG", "", user.id).await.unwrap();
        (
            ConnectionStore::new(db.clone(), TokenCipher::from_secret("test-secret")),
            OAuthStateStore::new(db.clone()),
            db,
            ws.id,
            user.id,
        )
    }

    fn linked(external_id: &str, token: &str, expires_in: Duration) -> LinkedAccount {
        LinkedAccount {
            external_account_id: external_id.to_string(),
            username: "shop".to_string(),
            account_type: "BUSINESS".to_string(),
            access_token: token.to_string(),
            expires_at: Utc::now() + expires_in,
            scopes: vec!["instagram_basic".to_string()],
            metadata: json!({ "page_id": "1" }),
        }
    }

    #[tokio::test]
    async fn test_upsert_encrypts_and_updates_in_place() {
        let (store, _, db, ws, _) = setup().await;

        let first = store
            .upsert(ws, &linked("ig_1", "token-one", Duration::days(60)))
            .await
            .unwrap();
        assert_eq!(first.status, ConnectionStatus::Active);
        assert_ne!(first.encrypted_access_token, "token-one");
        assert_eq!(store.access_token(&first).unwrap(), "token-one");
        assert_eq!(first.scopes, vec!["instagram_basic"]);
        assert_eq!(first.metadata["page_id"], "1");

        let raw: String = db
            .lock()
            .await
            .query_row(
                "SELECT encrypted_access_token FROM ig_account_connections WHERE id = ?1",
                params![first.id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("token-one"));

        store.revoke(first.id).await.unwrap();
        let second = store
            .upsert(ws, &linked("ig_1", "token-two", Duration::days(60)))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, ConnectionStatus::Active);
        assert_eq!(store.access_token(&second).unwrap(), "token-two");
        assert_eq!(store.list(ws).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_wipes_token() {
        let (store, _, _, ws, _) = setup().await;
        let conn = store
            .upsert(ws, &linked("ig_2", "secret", Duration::days(1)))
            .await
            .unwrap();

        let revoked = store.revoke(conn.id).await.unwrap();
        assert_eq!(revoked.status, ConnectionStatus::Revoked);
        assert!(!revoked.has_token());
        assert_eq!(store.access_token(&revoked).unwrap(), "");
    }

    #[tokio::test]
    async fn test_get_is_scoped_to_workspace() {
        let (store, _, _, ws, _) = setup().await;
        let conn = store
            .upsert(ws, &linked("ig_3", "t", Duration::days(1)))
            .await
            .unwrap();
        assert!(store.get(ws, conn.id).await.unwrap().is_some());
        assert!(store.get(Uuid::new_v4(), conn.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_for_workspace_skips_revoked() {
        let (store, _, _, ws, _) = setup().await;
        assert!(store.active_for_workspace(ws).await.unwrap().is_none());

        let kept = store
            .upsert(ws, &linked("ig_a", "t", Duration::days(1)))
            .await
            .unwrap();
        let dropped = store
            .upsert(ws, &linked("ig_b", "t", Duration::days(1)))
            .await
            .unwrap();
        store.revoke(dropped.id).await.unwrap();

        let active = store.active_for_workspace(ws).await.unwrap().unwrap();
        assert_eq!(active.id, kept.id);
    }

    #[tokio::test]
    async fn test_expire_stale_only_touches_past_expiry() {
        let (store, _, _, ws, _) = setup().await;
        let stale = store
            .upsert(ws, &linked("old", "t", Duration::seconds(-5)))
            .await
            .unwrap();
        let fresh = store
            .upsert(ws, &linked("new", "t", Duration::days(30)))
            .await
            .unwrap();

        assert_eq!(store.expire_stale().await.unwrap(), 1);
        assert_eq!(
            store.get(ws, stale.id).await.unwrap().unwrap().status,
            ConnectionStatus::Expired
        );
        assert_eq!(
            store.get(ws, fresh.id).await.unwrap().unwrap().status,
            ConnectionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_oauth_state_is_single_use() {
        let (_, states, _, ws, user) = setup().await;
        let state = states.issue(ws, user).await.unwrap();

        let pending = states.consume(&state).await.unwrap().unwrap();
        assert_eq!(pending.workspace_id, ws);
        assert_eq!(pending.user_id, user);
        assert!(states.consume(&state).await.unwrap().is_none());
        assert!(states.consume("never-issued").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_oauth_state_is_rejected_and_purged() {
        let (_, states, db, ws, user) = setup().await;
        {
            let conn = db.lock().await;
            let past = db::ts(&(Utc::now() - Duration::minutes(1)));
            for state in ["old-1", "old-2"] {
                conn.execute(
                    "INSERT INTO oauth_states (state, workspace_id, user_id, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![state, ws.to_string(), user.to_string(), past],
                )
                .unwrap();
            }
        }
        assert!(states.consume("old-1").await.unwrap().is_none());
        assert_eq!(states.purge_expired().await.unwrap(), 1);
    }
}
