// Distributed Lock Service - fleet-wide mutual exclusion keyed by job name

use crate::application::processor::constants::{LOCK_KEY_PREFIX, UNKNOWN_HOST};
use crate::error::{AppError, Result};
use crate::port::{LockStore, TimeProvider};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// TTL-bounded named locks over a [`LockStore`].
///
/// Each service instance carries its own holder token, so a release only ever
/// removes a lock this instance acquired. Ownership lives in the store, never
/// in process memory.
pub struct DistributedLockService {
    store: Arc<dyn LockStore>,
    time_provider: Arc<dyn TimeProvider>,
    holder: String,
    retry_delay: Duration,
}

impl DistributedLockService {
    pub fn new(
        store: Arc<dyn LockStore>,
        time_provider: Arc<dyn TimeProvider>,
        retry_delay: Duration,
    ) -> Self {
        let holder = format!("{}:{}", host_name(), Uuid::new_v4());
        Self::with_holder(store, time_provider, retry_delay, holder)
    }

    pub fn with_holder(
        store: Arc<dyn LockStore>,
        time_provider: Arc<dyn TimeProvider>,
        retry_delay: Duration,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            time_provider,
            holder: holder.into(),
            retry_delay,
        }
    }

    /// Holder token written next to every lock this instance takes
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Store key for a lock name
    pub fn lock_key(name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Lock name must not be empty".to_string()));
        }
        Ok(format!("{}:{}", LOCK_KEY_PREFIX, name))
    }

    /// Non-blocking acquire. `Ok(true)` iff this instance now holds `name` for `duration`.
    ///
    /// Backend failures surface as errors; callers must treat them as not acquired.
    pub async fn try_acquire_lock(&self, name: &str, duration: Duration) -> Result<bool> {
        if duration.is_zero() {
            return Err(AppError::Validation(
                "Lock duration must be greater than zero".to_string(),
            ));
        }
        let key = Self::lock_key(name)?;

        let acquired = self.store.set_if_absent(&key, &self.holder, duration).await?;
        if acquired {
            info!(
                lock_key = %key,
                holder = %self.holder,
                duration_minutes = duration.as_secs_f64() / 60.0,
                "Lock acquired"
            );
        } else {
            debug!(lock_key = %key, "Lock already held");
        }
        Ok(acquired)
    }

    /// Idempotent release; never fails
    pub async fn release_lock(&self, name: &str) {
        let key = match Self::lock_key(name) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring release of invalid lock name");
                return;
            }
        };

        match self.store.delete_if_held(&key, &self.holder).await {
            Ok(true) => info!(lock_key = %key, holder = %self.holder, "Lock released"),
            Ok(false) => debug!(lock_key = %key, "Lock not held by this instance, nothing to release"),
            Err(e) => warn!(lock_key = %key, error = %e, "Failed to release lock; it will expire on its own"),
        }
    }

    /// Acquire `name` (polling for up to twice `duration`), run `action`, then
    /// release the lock whatever the action returned. A panic in `action` is
    /// resumed once the lock is released.
    pub async fn run_with_lock<F, Fut, R>(&self, name: &str, duration: Duration, action: F) -> Result<R>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<R>> + Send,
        R: Send,
    {
        let started = self.time_provider.now_millis();
        let budget_ms = i64::try_from(duration.as_millis().saturating_mul(2)).unwrap_or(i64::MAX);
        let deadline = started.saturating_add(budget_ms);

        loop {
            if self.try_acquire_lock(name, duration).await? {
                break;
            }
            let now = self.time_provider.now_millis();
            if now >= deadline {
                return Err(AppError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: now - started,
                });
            }
            tokio::time::sleep(self.retry_delay).await;
        }

        let outcome = AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await;
        self.release_lock(name).await;
        match outcome {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}
