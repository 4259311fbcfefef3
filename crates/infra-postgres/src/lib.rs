// fleetbatch Infrastructure - Postgres Adapter
// Implements: LedgerRepository + LedgerClaim, LockStore, Row Lock Primitive

mod claim;
mod connection;
mod error;
mod ledger_repository;
mod lock_store;
mod migration;
mod row_lock;

pub use claim::PgLedgerClaim;
pub use connection::create_pool;
pub use error::map_sqlx_error;
pub use ledger_repository::PgLedgerRepository;
pub use lock_store::PgLockStore;
pub use migration::run_migrations;
pub use row_lock::apply_row_lock;

// Note: sqlx::Error conversion goes through map_sqlx_error
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)

/// Connection string for the Postgres-backed tests; they are skipped when unset
pub const TEST_DATABASE_URL_ENV: &str = "FLEETBATCH_TEST_DATABASE_URL";
