// Postgres LockStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use fleetbatch_core::error::{AppError, Result};
use fleetbatch_core::port::LockStore;
use sqlx::PgPool;
use std::time::Duration;

/// Named locks in the `distributed_locks` table.
///
/// Acquire is a single upsert that only overwrites an expired entry, so it is
/// atomic across the fleet. Expiry is judged by the database clock, never by
/// the caller's.
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete entries that expired before now; returns the number removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        // Any backend error propagates: an unknown outcome is never a grant
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO distributed_locks (lock_key, holder, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at <= now()
            RETURNING lock_key
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::LockUnavailable(map_sqlx_error(e).to_string()))?;

        Ok(acquired.is_some())
    }

    async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::LockUnavailable(map_sqlx_error(e).to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn setup_store() -> Option<PgLockStore> {
        let Ok(url) = std::env::var(crate::TEST_DATABASE_URL_ENV) else {
            eprintln!("skipping: {} not set", crate::TEST_DATABASE_URL_ENV);
            return None;
        };
        let pool = create_pool(&url, 4).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Some(PgLockStore::new(pool))
    }

    fn unique_key() -> String {
        format!("fleetbatch:locks:test-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let Some(store) = setup_store().await else { return };
        let key = unique_key();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent(&key, "a", ttl).await.unwrap());
        assert!(!store.set_if_absent(&key, "b", ttl).await.unwrap());
        assert!(!store.set_if_absent(&key, "a", ttl).await.unwrap());

        assert!(!store.delete_if_held(&key, "b").await.unwrap());
        assert!(store.delete_if_held(&key, "a").await.unwrap());
        assert!(!store.delete_if_held(&key, "a").await.unwrap());
        assert!(store.set_if_absent(&key, "b", ttl).await.unwrap());
        store.delete_if_held(&key, "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entry_is_taken_over() {
        let Some(store) = setup_store().await else { return };
        let key = unique_key();

        assert!(store.set_if_absent(&key, "a", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.set_if_absent(&key, "b", Duration::from_secs(60)).await.unwrap());

        // The stale holder can no longer release it
        assert!(!store.delete_if_held(&key, "a").await.unwrap());
        assert!(store.delete_if_held(&key, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_racing_acquires_grant_one() {
        let Some(store) = setup_store().await else { return };
        let key = unique_key();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent(&key, &format!("holder-{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        store.purge_expired().await.unwrap();
    }
}
