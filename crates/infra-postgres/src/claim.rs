// Postgres claim transaction

use crate::error::map_sqlx_error;
use crate::ledger_repository::update_row;
use async_trait::async_trait;
use fleetbatch_core::domain::{LedgerId, LedgerRecord};
use fleetbatch_core::error::{AppError, Result};
use fleetbatch_core::port::{LedgerClaim, TimeProvider, Transaction};
use serde::de::DeserializeOwned;
use sqlx::{Postgres, Transaction as SqlxTransaction};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Open transaction holding the `FOR UPDATE SKIP LOCKED` locks of one claimed batch.
///
/// Each write-back runs in its own savepoint, so a failing row leaves the
/// transaction usable for the rest of the batch. Dropping the claim without
/// commit rolls every write-back back and frees the rows.
pub struct PgLedgerClaim<P> {
    tx: SqlxTransaction<'static, Postgres>,
    table: String,
    claimed: HashSet<LedgerId>,
    time_provider: Arc<dyn TimeProvider>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> PgLedgerClaim<P> {
    pub(crate) fn new(
        tx: SqlxTransaction<'static, Postgres>,
        table: String,
        claimed: HashSet<LedgerId>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            tx,
            table,
            claimed,
            time_provider,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Send> Transaction for PgLedgerClaim<P> {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[async_trait]
impl<P> LedgerClaim<LedgerRecord<P>> for PgLedgerClaim<P>
where
    P: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn write_back(&mut self, item: &LedgerRecord<P>) -> Result<LedgerRecord<P>> {
        if !self.claimed.contains(&item.id) {
            return Err(AppError::InvalidState(format!(
                "Ledger row {} is not part of this claim",
                item.id
            )));
        }

        let now = self.time_provider.now();
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        let written = match update_row(&mut *savepoint, &self.table, item, None, now).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                savepoint.rollback().await.map_err(map_sqlx_error)?;
                return Err(AppError::NotFound(format!("Ledger row {} not found", item.id)));
            }
            Err(e) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(item_id = %item.id, error = %rollback_err, "Failed to roll back write-back savepoint");
                }
                return Err(e);
            }
        };

        savepoint.commit().await.map_err(map_sqlx_error)?;
        Ok(written)
    }
}
