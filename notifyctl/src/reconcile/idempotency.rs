//! Duplicate suppression for inbound callbacks, keyed on the provider's `idempotencyKey`.

use async_trait::async_trait;
use moka::future::Cache;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;

use crate::{errors::Result, queue::errors::StoreError};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` was recorded within the retention window.
    async fn is_duplicate(&self, key: &str) -> Result<bool>;

    /// Mark `key` as processed.
    async fn record(&self, key: &str) -> Result<()>;
}

/// Per-process TTL cache. Duplicates arriving at another replica are not suppressed.
pub struct MokaIdempotencyStore {
    keys: Cache<String, ()>,
}

impl MokaIdempotencyStore {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            keys: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MokaIdempotencyStore {
    async fn is_duplicate(&self, key: &str) -> Result<bool> {
        Ok(self.keys.contains_key(key))
    }

    async fn record(&self, key: &str) -> Result<()> {
        self.keys.insert(key.to_string(), ()).await;
        Ok(())
    }
}

/// Keys in `callback_idempotency_keys`, shared by every replica.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), err)]
    async fn is_duplicate(&self, key: &str) -> Result<bool> {
        let seen = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM callback_idempotency_keys
                WHERE idempotency_key = $1
                  AND processed_at > now() - make_interval(secs => $2)
            )",
        )
        .bind(key)
        .bind(self.ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(seen)
    }

    #[instrument(skip(self), err)]
    async fn record(&self, key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO callback_idempotency_keys (idempotency_key) VALUES ($1)
             ON CONFLICT (idempotency_key) DO UPDATE SET processed_at = now()",
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(())
    }
}
