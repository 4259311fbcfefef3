// Postgres LedgerRepository Implementation

use crate::claim::PgLedgerClaim;
use crate::error::map_sqlx_error;
use crate::migration::SCHEMA_LOCK_KEY;
use crate::row_lock::apply_row_lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetbatch_core::domain::{
    LedgerId, LedgerRecord, LockMode, ProcessingState, ProcessingStatus,
};
use fleetbatch_core::error::{AppError, Result};
use fleetbatch_core::port::{
    ClaimedBatch, IdProvider, LedgerFilter, LedgerRepository, TimeProvider,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgConnection, PgPool, Postgres};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Column list shared by every statement returning ledger rows
pub(crate) const COLUMNS: &str = "id, entity_type, action, payload, status, \
    external_correlation_id, error_reason, retry_count, date_created, date_modified";

const MAX_TABLE_NAME_LEN: usize = 63;

/// Ledger table for one job family.
///
/// Rows are `LedgerRecord<P>` with `P` stored as jsonb. Claims run in their
/// own transaction and hold `FOR UPDATE SKIP LOCKED` row locks until the
/// returned claim is committed or dropped.
pub struct PgLedgerRepository<P> {
    pool: PgPool,
    table: String,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> PgLedgerRepository<P>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        pool: PgPool,
        table: &str,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    ) -> Result<Self> {
        Ok(Self {
            pool,
            table: validate_table_name(table)?,
            time_provider,
            id_provider,
            _payload: PhantomData,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table and its claim index if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id                      UUID PRIMARY KEY,
                entity_type             TEXT NOT NULL,
                action                  TEXT NOT NULL,
                payload                 JSONB NOT NULL,
                status                  TEXT NOT NULL
                    CHECK (status IN ('Pending', 'Processed', 'Error', 'Aborted')),
                external_correlation_id TEXT NULL,
                error_reason            TEXT NULL,
                retry_count             SMALLINT NOT NULL DEFAULT 0
                    CHECK (retry_count BETWEEN 0 AND 255),
                date_created            TIMESTAMPTZ NOT NULL,
                date_modified           TIMESTAMPTZ NOT NULL
            )
            "#,
            table = self.table
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS ix_{table}_claim ON {table} (status, date_created, id)",
            table = self.table
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        info!(table = %self.table, "Ledger table ready");
        Ok(())
    }

    /// Filtered, ordered select. Binds: statuses, excluded ids, min retry, max retry, limit.
    fn select_sql(&self) -> String {
        format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE status = ANY($1) \
               AND NOT (id = ANY($2)) \
               AND ($3::SMALLINT IS NULL OR retry_count >= $3) \
               AND ($4::SMALLINT IS NULL OR retry_count < $4) \
             ORDER BY date_created, id \
             LIMIT $5",
            table = self.table
        )
    }

    async fn insert_row(
        &self,
        conn: &mut PgConnection,
        mut item: LedgerRecord<P>,
        now: DateTime<Utc>,
    ) -> Result<LedgerRecord<P>> {
        item.id = self.id_provider.generate_id();
        item.processing.date_created = now;
        item.processing.date_modified = now;

        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "INSERT INTO {table} ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {COLUMNS}",
            table = self.table
        ))
        .bind(item.id)
        .bind(&item.entity_type)
        .bind(&item.action)
        .bind(serde_json::to_value(&item.payload)?)
        .bind(item.processing.status.as_str())
        .bind(&item.processing.external_correlation_id)
        .bind(&item.processing.error_reason)
        .bind(i16::from(item.processing.retry_count))
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await
        .map_err(map_sqlx_error)?;

        row.into_record()
    }
}

/// Rewrite the mutable columns of one row.
///
/// With `expected` set, the row is only touched while its stored status still
/// equals it. `Ok(None)` when the id is gone or the guard did not match.
pub(crate) async fn update_row<P: DeserializeOwned>(
    conn: &mut PgConnection,
    table: &str,
    item: &LedgerRecord<P>,
    expected: Option<ProcessingStatus>,
    now: DateTime<Utc>,
) -> Result<Option<LedgerRecord<P>>> {
    let row = sqlx::query_as::<_, LedgerRow>(&format!(
        "UPDATE {table} \
         SET status = $2, external_correlation_id = $3, error_reason = $4, \
             retry_count = $5, date_modified = $6 \
         WHERE id = $1 \
           AND ($7::TEXT IS NULL OR status = $7) \
         RETURNING {COLUMNS}"
    ))
    .bind(item.id)
    .bind(item.processing.status.as_str())
    .bind(&item.processing.external_correlation_id)
    .bind(&item.processing.error_reason)
    .bind(i16::from(item.processing.retry_count))
    .bind(now)
    .bind(expected.map(|status| status.as_str()))
    .fetch_optional(conn)
    .await
    .map_err(map_sqlx_error)?;

    row.map(LedgerRow::into_record).transpose()
}

fn bind_filter<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    filter: &LedgerFilter,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    let statuses: Vec<String> = if filter.statuses.is_empty() {
        ProcessingStatus::ALL.iter().map(|s| s.as_str().to_string()).collect()
    } else {
        filter.statuses.iter().map(|s| s.as_str().to_string()).collect()
    };

    query
        .bind(statuses)
        .bind(filter.exclude_ids.clone())
        .bind(filter.retry_count_at_least.map(i16::from))
        .bind(filter.retry_count_below.map(i16::from))
        .bind(filter.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)))
}

#[async_trait]
impl<P> LedgerRepository<LedgerRecord<P>> for PgLedgerRepository<P>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.table
    }

    async fn query(
        &self,
        filter: &LedgerFilter,
        lock_mode: Option<LockMode>,
    ) -> Result<Vec<LedgerRecord<P>>> {
        let sql = match lock_mode {
            Some(mode) => apply_row_lock(&self.select_sql(), mode)?,
            None => self.select_sql(),
        };

        // Outside a claim the row lock lasts for this statement only
        let rows = bind_filter(sqlx::query_as::<_, LedgerRow>(&sql), filter)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(LedgerRow::into_record).collect()
    }

    async fn find_by_id(&self, id: LedgerId) -> Result<Option<LedgerRecord<P>>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1",
            table = self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(LedgerRow::into_record).transpose()
    }

    async fn create(&self, item: LedgerRecord<P>) -> Result<LedgerRecord<P>> {
        let now = self.time_provider.now();
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        self.insert_row(&mut conn, item, now).await
    }

    async fn create_many(&self, items: Vec<LedgerRecord<P>>) -> Result<Vec<LedgerRecord<P>>> {
        if items.is_empty() {
            return Err(AppError::Validation("No ledger items to create".to_string()));
        }

        let now = self.time_provider.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            created.push(self.insert_row(&mut *tx, item, now).await?);
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(table = %self.table, count = created.len(), "Created ledger rows");
        Ok(created)
    }

    async fn update(&self, item: LedgerRecord<P>) -> Result<LedgerRecord<P>> {
        let now = self.time_provider.now();
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        update_row(&mut conn, &self.table, &item, None, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ledger row {} not found", item.id)))
    }

    async fn update_many(&self, items: Vec<LedgerRecord<P>>) -> Result<Vec<LedgerRecord<P>>> {
        if items.is_empty() {
            return Err(AppError::Validation("No ledger items to update".to_string()));
        }

        let now = self.time_provider.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut updated = Vec::with_capacity(items.len());
        for item in &items {
            // Returning early drops `tx`, which rolls every row back
            let row = update_row(&mut *tx, &self.table, item, None, now)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Ledger row {} not found", item.id)))?;
            updated.push(row);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(updated)
    }

    async fn transition_many(
        &self,
        items: Vec<LedgerRecord<P>>,
        expected: ProcessingStatus,
    ) -> Result<Vec<LedgerRecord<P>>> {
        if items.is_empty() {
            return Err(AppError::Validation("No ledger items to update".to_string()));
        }

        let now = self.time_provider.now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut updated = Vec::with_capacity(items.len());
        for item in &items {
            match update_row(&mut *tx, &self.table, item, Some(expected), now).await? {
                Some(row) => updated.push(row),
                None => debug!(
                    table = %self.table,
                    item_id = %item.id,
                    expected = expected.as_str(),
                    "Ledger row left its expected status, skipping"
                ),
            }
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(updated)
    }

    async fn list_pending_for_claim(
        &self,
        batch_size: usize,
        exclude_ids: &[LedgerId],
    ) -> Result<ClaimedBatch<LedgerRecord<P>>> {
        if batch_size == 0 {
            return Err(AppError::Validation("Batch size must be greater than zero".to_string()));
        }

        let filter = LedgerFilter::with_status(ProcessingStatus::Pending)
            .excluding(exclude_ids)
            .limit(batch_size);
        let sql = apply_row_lock(&self.select_sql(), LockMode::SkipLocked)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let rows = bind_filter(sqlx::query_as::<_, LedgerRow>(&sql), &filter)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let items = rows
            .into_iter()
            .map(LedgerRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        let claimed: HashSet<LedgerId> = items.iter().map(|item| item.id).collect();
        debug!(table = %self.table, claimed = claimed.len(), excluded = exclude_ids.len(), "Claimed pending rows");

        Ok(ClaimedBatch {
            items,
            claim: Box::new(PgLedgerClaim::new(
                tx,
                self.table.clone(),
                claimed,
                Arc::clone(&self.time_provider),
            )),
        })
    }

    async fn count_by_status(&self, status: ProcessingStatus) -> Result<i64> {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {table} WHERE status = $1",
            table = self.table
        ))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn validate_table_name(name: &str) -> Result<String> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LEN {
        return Err(AppError::Config(format!(
            "Invalid ledger table name '{}': use lowercase letters, digits and '_' (max {} chars)",
            name, MAX_TABLE_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Postgres row representation
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LedgerRow {
    id: uuid::Uuid,
    entity_type: String,
    action: String,
    payload: serde_json::Value,
    status: String,
    external_correlation_id: Option<String>,
    error_reason: Option<String>,
    retry_count: i16,
    date_created: DateTime<Utc>,
    date_modified: DateTime<Utc>,
}

impl LedgerRow {
    pub(crate) fn into_record<P: DeserializeOwned>(self) -> Result<LedgerRecord<P>> {
        let retry_count = u8::try_from(self.retry_count).map_err(|_| {
            AppError::Database(format!(
                "Ledger row {} has out-of-range retry_count {}",
                self.id, self.retry_count
            ))
        })?;

        Ok(LedgerRecord {
            id: self.id,
            entity_type: self.entity_type,
            action: self.action,
            payload: serde_json::from_value(self.payload)?,
            processing: ProcessingState {
                status: self.status.parse()?,
                external_correlation_id: self.external_correlation_id,
                error_reason: self.error_reason,
                retry_count,
                date_created: self.date_created,
                date_modified: self.date_modified,
            },
        })
    }
}
