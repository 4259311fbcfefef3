// Transaction port for claim-scoped operations

use crate::domain::LedgerItem;
use crate::error::Result;
use async_trait::async_trait;

/// Transaction trait for atomic multi-step operations
#[async_trait]
pub trait Transaction: Send {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The open transaction behind a claimed batch.
///
/// Row locks taken by the claim query live exactly as long as this
/// transaction. Dropping it without commit rolls back every write-back.
#[async_trait]
pub trait LedgerClaim<T: LedgerItem>: Transaction {
    /// Persist the item's mutable columns within the claim.
    ///
    /// A failed write-back is isolated: it leaves the row as it was and does
    /// not affect write-backs for the other items of the batch.
    async fn write_back(&mut self, item: &T) -> Result<T>;
}
