// Migration Runner

use crate::error::map_sqlx_error;
use fleetbatch_core::error::Result;
use sqlx::{PgConnection, PgPool};
use tracing::info;

/// Advisory lock key serializing schema changes across the fleet
pub(crate) const SCHEMA_LOCK_KEY: i64 = 0x666c_6565_7462_6174;

const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "Initial schema",
    include_str!("../migrations/001_initial_schema.sql"),
)];

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

    // Instances starting together migrate one at a time
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&mut *tx)
    .await
    .map_err(map_sqlx_error)?;

    let current_version: i32 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

    info!("Current schema version: {}", current_version);

    for (version, name, sql) in MIGRATIONS {
        if current_version < *version {
            info!("Applying migration {:03}: {}", version, name);
            apply_migration(&mut tx, sql).await?;
        }
    }

    tx.commit().await.map_err(map_sqlx_error)?;
    info!("All migrations applied successfully");
    Ok(())
}

/// Execute every statement of a migration file
pub(crate) async fn apply_migration(conn: &mut PgConnection, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        // Remove comments and trim
        let clean_statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if !clean_statement.is_empty() {
            sqlx::query(&clean_statement)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}
