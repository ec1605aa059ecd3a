use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use uuid::Uuid;

use crate::{
    error::StoreError,
    models::challenge::{PendingAuthentication, PendingEnrollment},
};

/// Short-lived second-factor state: pending logins, pending enrollments and
/// the replay markers for consumed TOTP time steps.
///
/// Records carry their own expiry, which callers compare at read time; the
/// `ttl` arguments only bound how long the backend keeps them around.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn insert_pending(
        &self,
        pending: &PendingAuthentication,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn find_pending(&self, id: &str) -> Result<Option<PendingAuthentication>, StoreError>;
    /// Returns `false` if nothing was stored under `id`.
    async fn delete_pending(&self, id: &str) -> Result<bool, StoreError>;

    /// Records `(user_id, step)` as used. Returns `false` if it already was.
    async fn consume_time_step(
        &self,
        user_id: Uuid,
        step: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn put_enrollment(
        &self,
        enrollment: &PendingEnrollment,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn find_enrollment(&self, user_id: Uuid)
    -> Result<Option<PendingEnrollment>, StoreError>;
    async fn delete_enrollment(&self, user_id: Uuid) -> Result<(), StoreError>;
}

/// Redis-backed [`ChallengeStore`].
#[derive(Clone)]
pub struct RedisChallengeStore {
    redis: ConnectionManager,
}

impl RedisChallengeStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    async fn put_json<T: serde::Serialize + Sync>(
        &self,
        key: String,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json = sonic_rs::to_string(value)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", key, e)))?;
        let _: () = self
            .redis
            .clone()
            .set_ex(&key, json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: String,
    ) -> Result<Option<T>, StoreError> {
        let json: Option<String> = self.redis.clone().get(&key).await?;
        json.map(|json| {
            sonic_rs::from_str(&json).map_err(|e| StoreError::Corrupt(format!("{}: {}", key, e)))
        })
        .transpose()
    }
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn insert_pending(
        &self,
        pending: &PendingAuthentication,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(format!("challenge:{}", pending.id), pending, ttl)
            .await
    }

    async fn find_pending(&self, id: &str) -> Result<Option<PendingAuthentication>, StoreError> {
        self.get_json(format!("challenge:{}", id)).await
    }

    async fn delete_pending(&self, id: &str) -> Result<bool, StoreError> {
        let removed: u64 = self.redis.clone().del(format!("challenge:{}", id)).await?;
        Ok(removed > 0)
    }

    async fn consume_time_step(
        &self,
        user_id: Uuid,
        step: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let stored: Option<String> = redis::cmd("SET")
            .arg(format!("totp_used:{}:{}", user_id, step))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(stored.is_some())
    }

    async fn put_enrollment(
        &self,
        enrollment: &PendingEnrollment,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(format!("totp_enroll:{}", enrollment.user_id), enrollment, ttl)
            .await
    }

    async fn find_enrollment(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PendingEnrollment>, StoreError> {
        self.get_json(format!("totp_enroll:{}", user_id)).await
    }

    async fn delete_enrollment(&self, user_id: Uuid) -> Result<(), StoreError> {
        let _: () = self
            .redis
            .clone()
            .del(format!("totp_enroll:{}", user_id))
            .await?;
        Ok(())
    }
}
