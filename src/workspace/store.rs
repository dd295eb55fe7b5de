//! Workspace Storage
//! Mission: Persist workspaces, memberships and invitations

use crate::billing::Plan;
use crate::crypto;
use crate::db::{self, Database};
use crate::workspace::models::{
    InvitationStatus, MemberDetail, Membership, Role, Workspace, WorkspaceInvitation,
    WorkspaceSummary, INVITATION_TTL_DAYS,
};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

const WORKSPACE_COLUMNS: &str =
    "w.id, w.name, w.slug, w.description, w.owner_id, w.plan, w.created_at, w.updated_at";
const MEMBERSHIP_COLUMNS: &str =
    "m.id, m.user_id, m.workspace_id, m.role, m.created_at, m.updated_at";
const INVITATION_COLUMNS: &str = "id, workspace_id, email, role, token, invited_by, status, \
                                  expires_at, created_at, accepted_at";

fn enum_col<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            anyhow!(e).into(),
        )
    })
}

fn map_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let plan: String = row.get(5)?;
    Ok(Workspace {
        id: db::uuid_col(row, 0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        owner_id: db::uuid_col(row, 4)?,
        plan: Plan::from_stored(&plan),
        created_at: db::ts_col(row, 6)?,
        updated_at: db::ts_col(row, 7)?,
    })
}

/// Membership columns starting at `offset`
fn map_membership_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: db::uuid_col(row, offset)?,
        user_id: db::uuid_col(row, offset + 1)?,
        workspace_id: db::uuid_col(row, offset + 2)?,
        role: enum_col(row, offset + 3)?,
        created_at: db::ts_col(row, offset + 4)?,
        updated_at: db::ts_col(row, offset + 5)?,
    })
}

fn map_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    map_membership_at(row, 0)
}

fn map_invitation(row: &Row<'_>) -> rusqlite::Result<WorkspaceInvitation> {
    Ok(WorkspaceInvitation {
        id: db::uuid_col(row, 0)?,
        workspace_id: db::uuid_col(row, 1)?,
        email: row.get(2)?,
        role: enum_col(row, 3)?,
        token: row.get(4)?,
        invited_by: db::opt_uuid_col(row, 5)?,
        status: enum_col(row, 6)?,
        expires_at: db::ts_col(row, 7)?,
        created_at: db::ts_col(row, 8)?,
        accepted_at: db::opt_ts_col(row, 9)?,
    })
}

fn slug_taken(conn: &Connection, slug: &str) -> Result<bool> {
    let taken = conn
        .query_row(
            "SELECT 1 FROM workspaces WHERE slug = ?1",
            params![slug],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(taken)
}

/// First free slug among `base`, `base-1`, `base-2`, ...
fn unique_slug(conn: &Connection, base: &str) -> Result<String> {
    let mut candidate = base.to_string();
    let mut counter = 1;
    while slug_taken(conn, &candidate)? {
        candidate = format!("{base}-{counter}");
        counter += 1;
    }
    Ok(candidate)
}

fn insert_membership(
    conn: &Connection,
    workspace_id: Uuid,
    user_id: Uuid,
    role: Role,
) -> rusqlite::Result<Membership> {
    let now = Utc::now();
    let membership = Membership {
        id: Uuid::new_v4(),
        user_id,
        workspace_id,
        role,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO memberships (id, user_id, workspace_id, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            membership.id.to_string(),
            user_id.to_string(),
            workspace_id.to_string(),
            role.as_str(),
            db::ts(&now),
        ],
    )?;
    Ok(membership)
}

/// Create a workspace with its owner membership on an open connection or
/// transaction. Used both by the store and by sign-up.
pub fn insert_workspace(
    conn: &Connection,
    name: &str,
    description: &str,
    owner_id: Uuid,
) -> Result<Workspace> {
    let slug = unique_slug(conn, &crate::workspace::models::slugify(name))?;
    let now = Utc::now();
    let workspace = Workspace {
        id: Uuid::new_v4(),
        name: name.trim().to_string(),
        slug,
        description: description.to_string(),
        owner_id,
        plan: Plan::Starter,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO workspaces (id, name, slug, description, owner_id, plan, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            workspace.id.to_string(),
            workspace.name,
            workspace.slug,
            workspace.description,
            owner_id.to_string(),
            workspace.plan.as_str(),
            db::ts(&now),
        ],
    )
    .context("Failed to insert workspace")?;
    insert_membership(conn, workspace.id, owner_id, Role::Owner)
        .context("Failed to insert owner membership")?;

    info!("🏢 Created workspace: {} ({})", workspace.slug, workspace.id);
    Ok(workspace)
}

fn load_workspace(conn: &Connection, id: Uuid) -> Result<Option<Workspace>> {
    let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces w WHERE w.id = ?1");
    conn.query_row(&sql, params![id.to_string()], map_workspace)
        .optional()
        .context("Failed to load workspace")
}

/// Workspace storage with SQLite backend
#[derive(Clone)]
pub struct WorkspaceStore {
    db: Database,
}

impl WorkspaceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: &str, description: &str, owner_id: Uuid) -> Result<Workspace> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let workspace = insert_workspace(&tx, name, description, owner_id)?;
        tx.commit()?;
        Ok(workspace)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        let conn = self.db.lock().await;
        load_workspace(&conn, id)
    }

    /// Workspaces the user belongs to, newest first
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<WorkspaceSummary>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS}, u.email,
                    (SELECT COUNT(*) FROM memberships c WHERE c.workspace_id = w.id)
             FROM workspaces w
             JOIN memberships m ON m.workspace_id = w.id
             JOIN users u ON u.id = w.owner_id
             WHERE m.user_id = ?1
             ORDER BY w.created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                Ok(WorkspaceSummary {
                    workspace: map_workspace(row)?,
                    owner_email: row.get(8)?,
                    member_count: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn summary(&self, id: Uuid) -> Result<Option<WorkspaceSummary>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS}, u.email,
                    (SELECT COUNT(*) FROM memberships c WHERE c.workspace_id = w.id)
             FROM workspaces w
             JOIN users u ON u.id = w.owner_id
             WHERE w.id = ?1"
        );
        conn.query_row(&sql, params![id.to_string()], |row| {
            Ok(WorkspaceSummary {
                workspace: map_workspace(row)?,
                owner_email: row.get(8)?,
                member_count: row.get(9)?,
            })
        })
        .optional()
        .context("Failed to load workspace summary")
    }

    /// Partial update; the slug is kept as created
    pub async fn update(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Workspace>> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE workspaces
             SET name = COALESCE(?1, name),
                 description = COALESCE(?2, description),
                 updated_at = ?3
             WHERE id = ?4",
            params![
                name.map(str::trim),
                description,
                db::now_ts(),
                id.to_string()
            ],
        )
        .context("Failed to update workspace")?;
        load_workspace(&conn, id)
    }

    pub async fn set_plan(&self, id: Uuid, plan: Plan) -> Result<Option<Workspace>> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE workspaces SET plan = ?1, updated_at = ?2 WHERE id = ?3",
            params![plan.as_str(), db::now_ts(), id.to_string()],
        )
        .context("Failed to update plan")?;
        info!("💳 Workspace {} moved to plan {}", id, plan);
        load_workspace(&conn, id)
    }

    /// Delete a workspace; dependent rows go with it
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.db.lock().await;
        let deleted = conn
            .execute("DELETE FROM workspaces WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete workspace")?;
        if deleted > 0 {
            info!("🗑️  Deleted workspace: {}", id);
        }
        Ok(deleted > 0)
    }

    // ---- memberships ----

    pub async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships m
             WHERE m.workspace_id = ?1 AND m.user_id = ?2"
        );
        conn.query_row(
            &sql,
            params![workspace_id.to_string(), user_id.to_string()],
            map_membership,
        )
        .optional()
        .context("Failed to load membership")
    }

    pub async fn membership_by_id(
        &self,
        workspace_id: Uuid,
        membership_id: Uuid,
    ) -> Result<Option<Membership>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships m
             WHERE m.workspace_id = ?1 AND m.id = ?2"
        );
        conn.query_row(
            &sql,
            params![workspace_id.to_string(), membership_id.to_string()],
            map_membership,
        )
        .optional()
        .context("Failed to load membership")
    }

    pub async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<MemberDetail>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS}, u.email, u.full_name
             FROM memberships m JOIN users u ON u.id = m.user_id
             WHERE m.workspace_id = ?1
             ORDER BY m.created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let members = stmt
            .query_map(params![workspace_id.to_string()], |row| {
                Ok(MemberDetail {
                    membership: map_membership(row)?,
                    user_email: row.get(6)?,
                    user_full_name: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// Add a member. Returns `None` when the user already belongs to the workspace.
    pub async fn add_member(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Option<Membership>> {
        let conn = self.db.lock().await;
        match insert_membership(&conn, workspace_id, user_id, role) {
            Ok(membership) => Ok(Some(membership)),
            Err(e) if db::is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to insert membership"),
        }
    }

    pub async fn update_member_role(&self, membership_id: Uuid, role: Role) -> Result<Option<Membership>> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE memberships SET role = ?1, updated_at = ?2 WHERE id = ?3",
            params![role.as_str(), db::now_ts(), membership_id.to_string()],
        )
        .context("Failed to update membership")?;
        let sql = format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships m WHERE m.id = ?1");
        conn.query_row(&sql, params![membership_id.to_string()], map_membership)
            .optional()
            .context("Failed to reload membership")
    }

    pub async fn remove_member(&self, membership_id: Uuid) -> Result<bool> {
        let conn = self.db.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM memberships WHERE id = ?1",
                params![membership_id.to_string()],
            )
            .context("Failed to remove membership")?;
        Ok(removed > 0)
    }

    // ---- invitations ----

    pub async fn create_invitation(
        &self,
        workspace_id: Uuid,
        email: &str,
        role: Role,
        invited_by: Uuid,
    ) -> Result<WorkspaceInvitation> {
        let now = Utc::now();
        let invitation = WorkspaceInvitation {
            id: Uuid::new_v4(),
            workspace_id,
            email: email.to_string(),
            role,
            token: crypto::random_token(32),
            invited_by: Some(invited_by),
            status: InvitationStatus::Pending,
            expires_at: now + Duration::days(INVITATION_TTL_DAYS),
            created_at: now,
            accepted_at: None,
        };

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO workspace_invitations
                (id, workspace_id, email, role, token, invited_by, status, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                invitation.id.to_string(),
                workspace_id.to_string(),
                invitation.email,
                role.as_str(),
                invitation.token,
                invited_by.to_string(),
                invitation.status.as_str(),
                db::ts(&invitation.expires_at),
                db::ts(&now),
            ],
        )
        .context("Failed to insert invitation")?;

        info!("✉️  Invitation for {} to workspace {}", invitation.email, workspace_id);
        Ok(invitation)
    }

    pub async fn list_invitations(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceInvitation>> {
        let conn = self.db.lock().await;
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM workspace_invitations
             WHERE workspace_id = ?1 ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let invitations = stmt
            .query_map(params![workspace_id.to_string()], map_invitation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(invitations)
    }

    pub async fn invitation_by_token(&self, token: &str) -> Result<Option<WorkspaceInvitation>> {
        let conn = self.db.lock().await;
        let sql = format!("SELECT {INVITATION_COLUMNS} FROM workspace_invitations WHERE token = ?1");
        conn.query_row(&sql, params![token], map_invitation)
            .optional()
            .context("Failed to load invitation")
    }

    pub async fn mark_invitation_expired(&self, invitation_id: Uuid) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE workspace_invitations SET status = 'expired' WHERE id = ?1",
            params![invitation_id.to_string()],
        )
        .context("Failed to expire invitation")?;
        Ok(())
    }

    /// Accept a pending invitation for `user_id`. An existing membership is
    /// kept as is; the invitation is marked accepted either way.
    pub async fn accept_invitation(
        &self,
        invitation: &WorkspaceInvitation,
        user_id: Uuid,
    ) -> Result<Membership> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships m
             WHERE m.workspace_id = ?1 AND m.user_id = ?2"
        );
        let existing = tx
            .query_row(
                &sql,
                params![invitation.workspace_id.to_string(), user_id.to_string()],
                map_membership,
            )
            .optional()?;
        let membership = match existing {
            Some(m) => m,
            None => insert_membership(&tx, invitation.workspace_id, user_id, invitation.role)?,
        };

        tx.execute(
            "UPDATE workspace_invitations SET status = 'accepted', accepted_at = ?1 WHERE id = ?2",
            params![db::now_ts(), invitation.id.to_string()],
        )?;
        tx.commit()?;

        info!("🤝 User {} joined workspace {}", user_id, invitation.workspace_id);
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserStore;

    async fn setup() -> (WorkspaceStore, UserStore) {
        let db = Database::open_in_memory().unwrap();
        (WorkspaceStore::new(db.clone()), UserStore::new(db, 4))
    }

    async fn user(users: &UserStore, email: &str) -> Uuid {
        users.create(email, "", "password123").await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_create_assigns_owner_and_unique_slug() {
        let (store, users) = setup().await;
        let owner = user(&users, "owner@example.com").await;

        let first = store.create("My Shop", "", owner).await.unwrap();
        let second = store.create("My Shop", "", owner).await.unwrap();
        let third = store.create("my shop!", "", owner).await.unwrap();
        assert_eq!(first.slug, "my-shop");
        assert_eq!(second.slug, "my-shop-1");
        assert_eq!(third.slug, "my-shop-2");
        assert_eq!(first.plan, Plan::Starter);

        let membership = store.membership(first.id, owner).await.unwrap().unwrap();
        assert_eq!(membership.role, Role::Owner);
    }

    #[tokio::test]
    async fn test_list_for_user_only_includes_memberships() {
        let (store, users) = setup().await;
        let alice = user(&users, "alice@example.com").await;
        let bob = user(&users, "bob@example.com").await;

        let ws = store.create("Alice Co", "", alice).await.unwrap();
        store.create("Bob Co", "", bob).await.unwrap();
        store.add_member(ws.id, bob, Role::Member).await.unwrap();

        let alice_list = store.list_for_user(alice).await.unwrap();
        assert_eq!(alice_list.len(), 1);
        assert_eq!(alice_list[0].owner_email, "alice@example.com");
        assert_eq!(alice_list[0].member_count, 2);

        let bob_list = store.list_for_user(bob).await.unwrap();
        assert_eq!(bob_list.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_member_returns_none() {
        let (store, users) = setup().await;
        let owner = user(&users, "o@example.com").await;
        let ws = store.create("Dup", "", owner).await.unwrap();
        assert!(store.add_member(ws.id, owner, Role::Admin).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_slug() {
        let (store, users) = setup().await;
        let owner = user(&users, "o@example.com").await;
        let ws = store.create("Original", "", owner).await.unwrap();

        let updated = store
            .update(ws.id, Some("Renamed"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.slug, "original");
    }

    #[tokio::test]
    async fn test_delete_cascades_memberships() {
        let (store, users) = setup().await;
        let owner = user(&users, "o@example.com").await;
        let ws = store.create("Gone", "", owner).await.unwrap();

        assert!(store.delete(ws.id).await.unwrap());
        assert!(store.get(ws.id).await.unwrap().is_none());
        assert!(store.membership(ws.id, owner).await.unwrap().is_none());
        assert!(!store.delete(ws.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invitation_accept_creates_membership() {
        let (store, users) = setup().await;
        let owner = user(&users, "o@example.com").await;
        let invitee = user(&users, "new@example.com").await;
        let ws = store.create("Team", "", owner).await.unwrap();

        let invitation = store
            .create_invitation(ws.id, "new@example.com", Role::Admin, owner)
            .await
            .unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert!(!invitation.is_expired());

        let loaded = store
            .invitation_by_token(&invitation.token)
            .await
            .unwrap()
            .unwrap();
        let membership = store.accept_invitation(&loaded, invitee).await.unwrap();
        assert_eq!(membership.role, Role::Admin);

        let after = store
            .invitation_by_token(&invitation.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, InvitationStatus::Accepted);
        assert!(after.accepted_at.is_some());
        assert_eq!(store.list_invitations(ws.id).await.unwrap().len(), 1);
    }
}
