// Batch Action Port - the per-job business action invoked for each claimed item

use crate::domain::LedgerItem;
use async_trait::async_trait;
use thiserror::Error;

/// Successful outcome of a business action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    /// Identifier assigned by the external system (partner opportunity id, wallet id, ...)
    pub external_correlation_id: Option<String>,
}

impl ActionResult {
    pub fn with_correlation_id(id: impl Into<String>) -> Self {
        Self {
            external_correlation_id: Some(id.into()),
        }
    }
}

/// Business action failures; all of them are recorded on the ledger row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Rejected by partner: {0}")]
    Rejected(String),

    #[error("Partner unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Action panicked: {0}")]
    Panicked(String),
}

/// Business action supplied by each concrete job.
///
/// The engine invokes it at least once per item and may invoke it again
/// after a crash, so it must be idempotent or tolerate duplicates.
#[async_trait]
pub trait BatchAction<T: LedgerItem>: Send + Sync {
    async fn execute(&self, item: &T) -> Result<ActionResult, ActionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::LedgerId;
    use std::marker::PhantomData;
    use std::sync::Mutex;

    /// Action backed by a synchronous closure; records every invocation
    pub struct FnAction<T, F> {
        handler: F,
        calls: Mutex<Vec<LedgerId>>,
        _item: PhantomData<fn(&T)>,
    }

    impl<T, F> FnAction<T, F>
    where
        T: LedgerItem,
        F: Fn(&T) -> Result<ActionResult, ActionError> + Send + Sync,
    {
        pub fn new(handler: F) -> Self {
            Self {
                handler,
                calls: Mutex::new(Vec::new()),
                _item: PhantomData,
            }
        }

        /// Item ids in invocation order
        pub fn calls(&self) -> Vec<LedgerId> {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    #[async_trait]
    impl<T, F> BatchAction<T> for FnAction<T, F>
    where
        T: LedgerItem,
        F: Fn(&T) -> Result<ActionResult, ActionError> + Send + Sync,
    {
        async fn execute(&self, item: &T) -> Result<ActionResult, ActionError> {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(item.id());
            (self.handler)(item)
        }
    }
}
