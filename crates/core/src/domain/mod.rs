// Domain Layer - Pure business logic and entities

pub mod error;
pub mod ledger;
pub mod lock_mode;

// Re-exports
pub use error::DomainError;
pub use ledger::{LedgerId, LedgerItem, LedgerRecord, ProcessingState, ProcessingStatus};
pub use lock_mode::LockMode;
