// ID Provider Port (for deterministic testing)

use uuid::Uuid;

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new unique ledger row ID
    fn generate_id(&self) -> Uuid;
}

/// UUID v4 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

pub mod mocks {
    use super::IdProvider;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    /// Monotonic ids (00000000-...-000000000001, ...) so id order equals creation order
    #[derive(Debug, Default)]
    pub struct SequentialIdProvider {
        next: AtomicU64,
    }

    impl IdProvider for SequentialIdProvider {
        fn generate_id(&self) -> Uuid {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Uuid::from_u128(n as u128)
        }
    }
}
