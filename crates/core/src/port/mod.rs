// Port Layer - Interfaces for external dependencies

pub mod batch_action;
pub mod id_provider; // For deterministic testing
pub mod ledger_repository;
pub mod lock_store;
pub mod time_provider;
pub mod transaction;

// Re-exports
pub use batch_action::{ActionError, ActionResult, BatchAction};
pub use id_provider::IdProvider;
pub use ledger_repository::{ClaimedBatch, LedgerFilter, LedgerRepository};
pub use lock_store::LockStore;
pub use time_provider::TimeProvider;
pub use transaction::{LedgerClaim, Transaction};
