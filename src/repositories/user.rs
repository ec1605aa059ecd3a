use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::user::{NewUser, Role, User},
};

/// Lookup and update operations on user records owned by the data store.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Finds a user by case-insensitive email when `identifier` contains `@`,
    /// otherwise by exact username. Never matches on both columns at once.
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;
    /// Fails with [`StoreError::Duplicate`] when username, email or external id is taken.
    async fn insert(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError>;
    async fn link_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn update_totp_secret(
        &self,
        user_id: Uuid,
        sealed_secret: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Returns `false` when no such user exists.
    async fn update_role(
        &self,
        user_id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn touch_last_active(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Whether a login identifier names an email address rather than a username.
pub fn is_email_identifier(identifier: &str) -> bool {
    identifier.contains('@')
}

const USER_COLUMNS: &str = "id, username, email, display_name, role, password_hash, totp_secret, \
     external_id, email_verified, approved, created_at, updated_at, last_active_at";

/// A helper function to map a `tokio_postgres::Row` to a `User`.
fn row_to_user(row: &Row) -> Result<User, StoreError> {
    let column = |name: &str| StoreError::Corrupt(format!("users.{}", name));

    let id: Uuid = row.try_get("id").map_err(|_| column("id"))?;
    let raw_role: Option<String> = row.try_get("role").map_err(|_| column("role"))?;
    let role = raw_role.as_deref().and_then(Role::parse);
    if role.is_none() {
        tracing::warn!("User {} has unrecognised role {:?}", id, raw_role);
    }

    Ok(User {
        id,
        username: row.try_get("username").map_err(|_| column("username"))?,
        email: row.try_get("email").map_err(|_| column("email"))?,
        display_name: row.try_get("display_name").map_err(|_| column("display_name"))?,
        role,
        password_hash: row.try_get("password_hash").map_err(|_| column("password_hash"))?,
        totp_secret: row.try_get("totp_secret").map_err(|_| column("totp_secret"))?,
        external_id: row.try_get("external_id").map_err(|_| column("external_id"))?,
        email_verified: row.try_get("email_verified").map_err(|_| column("email_verified"))?,
        approved: row.try_get("approved").map_err(|_| column("approved"))?,
        created_at: row.try_get("created_at").map_err(|_| column("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(|_| column("updated_at"))?,
        last_active_at: row.try_get("last_active_at").map_err(|_| column("last_active_at"))?,
    })
}

/// PostgreSQL-backed [`UserStore`].
#[derive(Clone)]
pub struct PgUserStore {
    pool: Pool,
}

impl PgUserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn find_one(
        &self,
        predicate: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<User>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
        let row = client.query_opt(query.as_str(), params).await?;
        row.map(|r| row_to_user(&r)).transpose()
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>, StoreError> {
        if is_email_identifier(identifier) {
            self.find_one("email = lower($1)", &[&identifier]).await
        } else {
            self.find_one("username = $1", &[&identifier]).await
        }
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        self.find_one("id = $1", &[&user_id]).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.find_one("email = lower($1)", &[&email]).await
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        self.find_one("external_id = $1", &[&external_id]).await
    }

    async fn insert(&self, user: NewUser, now: DateTime<Utc>) -> Result<User, StoreError> {
        let client = self.pool.get().await?;
        let id = Uuid::new_v4();
        let query = format!(
            r#"
            INSERT INTO users (id, username, email, display_name, role, password_hash,
                external_id, email_verified, approved, created_at, updated_at)
            VALUES ($1, $2, lower($3), $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let row = client
            .query_one(
                query.as_str(),
                &[
                    &id,
                    &user.username,
                    &user.email,
                    &user.display_name,
                    &user.role.as_str(),
                    &user.password_hash,
                    &user.external_id,
                    &user.email_verified,
                    &user.approved,
                    &now,
                ],
            )
            .await
            .map_err(|e| StoreError::from_insert(e, "user"))?;
        row_to_user(&row)
    }

    async fn link_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE users SET external_id = $1, updated_at = $2 WHERE id = $3",
                &[&external_id, &now, &user_id],
            )
            .await
            .map_err(|e| StoreError::from_insert(e, "external_id"))?;
        Ok(())
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE users SET password_hash = $1, updated_at = $2 WHERE id = $3",
                &[&password_hash, &now, &user_id],
            )
            .await?;
        Ok(())
    }

    async fn update_totp_secret(
        &self,
        user_id: Uuid,
        sealed_secret: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE users SET totp_secret = $1, updated_at = $2 WHERE id = $3",
                &[&sealed_secret, &now, &user_id],
            )
            .await?;
        Ok(())
    }

    async fn update_role(
        &self,
        user_id: Uuid,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE users SET role = $1, updated_at = $2 WHERE id = $3",
                &[&role.as_str(), &now, &user_id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn touch_last_active(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE users SET last_active_at = $1 WHERE id = $2",
                &[&now, &user_id],
            )
            .await?;
        Ok(())
    }
}
