use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{error::StoreError, models::session::Session};

/// Persistence for session records. Every operation touches a single row or
/// is a single statement, so each is atomic on its own.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] if the id is already present.
    async fn insert(&self, session: &Session) -> Result<(), StoreError>;
    async fn find(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// Deleting a missing id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, StoreError>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn row_to_session(row: &Row) -> Result<Session, StoreError> {
    let column = |name: &str| StoreError::Corrupt(format!("sessions.{}", name));
    Ok(Session {
        id: row.try_get("id").map_err(|_| column("id"))?,
        user_id: row.try_get("user_id").map_err(|_| column("user_id"))?,
        created_at: row.try_get("created_at").map_err(|_| column("created_at"))?,
        expires_at: row.try_get("expires_at").map_err(|_| column("expires_at"))?,
        last_accessed_at: row
            .try_get("last_accessed_at")
            .map_err(|_| column("last_accessed_at"))?,
        client_ip: row.try_get("client_ip").map_err(|_| column("client_ip"))?,
        user_agent: row.try_get("user_agent").map_err(|_| column("user_agent"))?,
    })
}

/// PostgreSQL-backed [`SessionStore`].
#[derive(Clone)]
pub struct PgSessionStore {
    pool: Pool,
}

impl PgSessionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO sessions (id, user_id, created_at, expires_at, last_accessed_at,
                    client_ip, user_agent)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                &[
                    &session.id,
                    &session.user_id,
                    &session.created_at,
                    &session.expires_at,
                    &session.last_accessed_at,
                    &session.client_ip,
                    &session.user_agent,
                ],
            )
            .await
            .map_err(|e| StoreError::from_insert(e, "session"))?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT id, user_id, created_at, expires_at, last_accessed_at, client_ip, user_agent
                FROM sessions
                WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE sessions SET last_accessed_at = $1 WHERE id = $2",
                &[&at, &id],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM sessions WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        Ok(client
            .execute("DELETE FROM sessions WHERE user_id = $1", &[&user_id])
            .await?)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        Ok(client
            .execute("DELETE FROM sessions WHERE expires_at <= $1", &[&now])
            .await?)
    }
}
