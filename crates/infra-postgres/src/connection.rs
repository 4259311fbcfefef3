// Postgres Connection Pool Setup

use crate::error::map_sqlx_error;
use fleetbatch_core::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a Postgres pool. Every open claim pins one connection, so size the
/// pool above the number of jobs that may run at once on this host.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(map_sqlx_error)
}
