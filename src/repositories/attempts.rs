use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::StoreError;

/// Attempt counters keyed by identifier or user, each expiring after a window.
///
/// A slot is reserved before the guarded check runs, so concurrent attempts
/// each see their own count.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Atomically adds one attempt and restarts the window. Returns the new count.
    async fn reserve(&self, key: &str, window: Duration) -> Result<u32, StoreError>;
    /// Gives back a reserved slot that did not end in a counted failure.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Redis-backed [`AttemptStore`] using INCR + EXPIRE.
#[derive(Clone)]
pub struct RedisAttemptStore {
    redis: ConnectionManager,
}

impl RedisAttemptStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl AttemptStore for RedisAttemptStore {
    async fn reserve(&self, key: &str, window: Duration) -> Result<u32, StoreError> {
        let key = format!("rate_limit:{}", key);

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, window.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut self.redis.clone())
            .await?;

        Ok(count)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let key = format!("rate_limit:{}", key);

        let remaining: i64 = redis::cmd("DECR")
            .arg(&key)
            .query_async(&mut self.redis.clone())
            .await?;
        if remaining <= 0 {
            let _: () = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let _: () = redis::cmd("DEL")
            .arg(format!("rate_limit:{}", key))
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(())
    }
}
