// Adapter wiring (Composition Root)

use crate::settings::{DaemonConfig, JobConfig};
use anyhow::{Context, Result};
use fleetbatch_core::application::{DistributedLockService, RetryPolicy, ScheduledProcessor};
use fleetbatch_core::domain::LedgerRecord;
use fleetbatch_core::port::id_provider::UuidProvider;
use fleetbatch_core::port::time_provider::SystemTimeProvider;
use fleetbatch_core::port::{IdProvider, TimeProvider};
use fleetbatch_infra_http::HttpDispatchAction;
use fleetbatch_infra_postgres::{create_pool, run_migrations, PgLedgerRepository, PgLockStore};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Ledger rows as configured jobs see them: the payload stays raw JSON
pub type JobItem = LedgerRecord<Value>;

/// Shared infrastructure for every configured job
pub struct Services {
    pub pool: PgPool,
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_provider: Arc<dyn IdProvider>,
    pub locks: Arc<DistributedLockService>,
}

impl Services {
    /// Connect, migrate, drop stale lock entries and build the lock service
    pub async fn connect(config: &DaemonConfig) -> Result<Self> {
        let pool = create_pool(&config.database_url, config.max_connections)
            .await
            .context("Failed to connect to database")?;
        run_migrations(&pool).await?;

        let lock_store = PgLockStore::new(pool.clone());
        match lock_store.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Removed expired lock entries"),
            Err(e) => warn!(error = %e, "Could not purge expired lock entries"),
        }

        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let locks = Arc::new(DistributedLockService::new(
            Arc::new(lock_store),
            time_provider.clone(),
            config.schedule.lock_retry_delay(),
        ));

        Ok(Self {
            pool,
            time_provider,
            id_provider: Arc::new(UuidProvider),
            locks,
        })
    }

    /// The job's ledger table, created if missing
    pub async fn ledger(&self, job: &JobConfig) -> Result<Arc<PgLedgerRepository<Value>>> {
        let ledger = PgLedgerRepository::new(
            self.pool.clone(),
            &job.ledger,
            self.time_provider.clone(),
            self.id_provider.clone(),
        )?;
        ledger.ensure_schema().await?;
        Ok(Arc::new(ledger))
    }

    pub async fn processor(
        &self,
        config: &DaemonConfig,
        job: &JobConfig,
    ) -> Result<ScheduledProcessor<JobItem>> {
        let ledger = self.ledger(job).await?;
        let action = HttpDispatchAction::<Value>::new(&job.endpoint, job.request_timeout())?;
        let processor = ScheduledProcessor::new(
            job.options(),
            config.schedule.clone(),
            ledger,
            Arc::new(action),
            self.locks.clone(),
            self.time_provider.clone(),
        )?;
        Ok(processor)
    }

    pub fn retry_policy(&self, job: &JobConfig) -> RetryPolicy {
        RetryPolicy::new(job.retry.max_retry_attempts, self.time_provider.clone())
    }

    /// Lock duration for out-of-band maintenance on a job's ledger
    pub fn maintenance_lock_duration(&self, config: &DaemonConfig, job: &JobConfig) -> Duration {
        job.options().max_interval(&config.schedule) + config.schedule.lock_duration_buffer()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
