// Lock Store Port - key/value with atomic set-if-absent and TTL

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Backend for the distributed lock service.
///
/// Implementations must make `set_if_absent` atomic across the whole fleet
/// and must let an entry lapse once its TTL has passed, even if it is never
/// deleted. A backend that cannot decide must return an error, never `true`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `holder` under `key` for `ttl` unless a live entry exists.
    /// Returns true iff this call created the entry.
    async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key` only if it is still held by `holder`.
    /// Returns true iff an entry was removed.
    async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::LockStore;
    use crate::error::{AppError, Result};
    use crate::port::time_provider::{SystemTimeProvider, TimeProvider};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Entry {
        holder: String,
        expires_at_millis: i64,
    }

    /// In-memory lock store shared by cloning (one instance per simulated fleet)
    #[derive(Clone)]
    pub struct InMemoryLockStore {
        entries: Arc<Mutex<HashMap<String, Entry>>>,
        time_provider: Arc<dyn TimeProvider>,
    }

    impl Default for InMemoryLockStore {
        fn default() -> Self {
            Self::new(Arc::new(SystemTimeProvider))
        }
    }

    impl InMemoryLockStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                entries: Arc::new(Mutex::new(HashMap::new())),
                time_provider,
            }
        }

        /// Current live holder of `key`, if any
        pub fn holder_of(&self, key: &str) -> Option<String> {
            let now = self.time_provider.now_millis();
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries
                .get(key)
                .filter(|entry| entry.expires_at_millis > now)
                .map(|entry| entry.holder.clone())
        }
    }

    #[async_trait]
    impl LockStore for InMemoryLockStore {
        async fn set_if_absent(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
            let now = self.time_provider.now_millis();
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = entries.get(key) {
                if entry.expires_at_millis > now {
                    return Ok(false);
                }
            }
            entries.insert(
                key.to_string(),
                Entry {
                    holder: holder.to_string(),
                    expires_at_millis: now + ttl.as_millis() as i64,
                },
            );
            Ok(true)
        }

        async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool> {
            let now = self.time_provider.now_millis();
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(entry) if entry.holder == holder && entry.expires_at_millis > now => {
                    entries.remove(key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    /// Backend that is always unreachable
    #[derive(Debug, Default)]
    pub struct FailingLockStore;

    #[async_trait]
    impl LockStore for FailingLockStore {
        async fn set_if_absent(&self, key: &str, _holder: &str, _ttl: Duration) -> Result<bool> {
            Err(AppError::LockUnavailable(format!("cannot reach lock backend for '{}'", key)))
        }

        async fn delete_if_held(&self, key: &str, _holder: &str) -> Result<bool> {
            Err(AppError::LockUnavailable(format!("cannot reach lock backend for '{}'", key)))
        }
    }
}
