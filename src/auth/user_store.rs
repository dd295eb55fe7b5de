//! User Storage
//! Mission: Securely store and manage user accounts with SQLite

use crate::auth::models::User;
use crate::db::{self, Database};
use anyhow::{Context, Result};
use bcrypt::{hash, verify};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::info;
use uuid::Uuid;

const USER_COLUMNS: &str = "id, email, full_name, password_hash, date_joined, last_login";

/// User storage with SQLite backend
#[derive(Clone)]
pub struct UserStore {
    db: Database,
    bcrypt_cost: u32,
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: db::uuid_col(row, 0)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        password_hash: row.get(3)?,
        date_joined: db::ts_col(row, 4)?,
        last_login: db::opt_ts_col(row, 5)?,
    })
}

impl UserStore {
    pub fn new(db: Database, bcrypt_cost: u32) -> Self {
        Self { db, bcrypt_cost }
    }

    /// Create a user. Returns `None` when the email is already registered.
    pub async fn create(&self, email: &str, full_name: &str, password: &str) -> Result<Option<User>> {
        self.create_with(email, full_name, password, |_, _| Ok(())).await
    }

    /// Create a user and run `then` inside the same transaction, so
    /// follow-up rows (e.g. a first workspace) commit or roll back together.
    pub async fn create_with<F>(
        &self,
        email: &str,
        full_name: &str,
        password: &str,
        then: F,
    ) -> Result<Option<User>>
    where
        F: FnOnce(&Transaction<'_>, &User) -> Result<()>,
    {
        let password_hash = hash(password, self.bcrypt_cost).context("Failed to hash password")?;

        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name: full_name.trim().to_string(),
            password_hash,
            date_joined: Utc::now(),
            last_login: None,
        };

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO users (id, email, full_name, password_hash, date_joined, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                user.id.to_string(),
                user.email,
                user.full_name,
                user.password_hash,
                db::ts(&user.date_joined),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if db::is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(e).context("Failed to insert user"),
        }

        then(&tx, &user)?;
        tx.commit().context("Failed to commit user")?;

        info!("✅ Created user: {} ({})", user.email, user.id);
        Ok(Some(user))
    }

    fn query_one(conn: &Connection, clause: &str, value: String) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause} = ?1");
        conn.query_row(&sql, params![value], map_user)
            .optional()
            .context("Failed to load user")
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.db.lock().await;
        Self::query_one(&conn, "email", email.to_string())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.db.lock().await;
        Self::query_one(&conn, "id", id.to_string())
    }

    /// Verify email and password; returns the user on success
    pub async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<User>> {
        match self.get_by_email(email).await? {
            Some(user) => {
                let valid =
                    verify(password, &user.password_hash).context("Failed to verify password")?;
                Ok(valid.then_some(user))
            }
            None => Ok(None),
        }
    }

    pub async fn touch_last_login(&self, id: Uuid) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![db::now_ts(), id.to_string()],
        )
        .context("Failed to update last login")?;
        Ok(())
    }

    pub async fn update_full_name(&self, id: Uuid, full_name: &str) -> Result<Option<User>> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE users SET full_name = ?1 WHERE id = ?2",
            params![full_name.trim(), id.to_string()],
        )
        .context("Failed to update user")?;
        Self::query_one(&conn, "id", id.to_string())
    }
}
