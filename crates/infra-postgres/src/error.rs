// sqlx::Error -> AppError mapping

use fleetbatch_core::error::AppError;

// Postgres SQLSTATE codes: https://www.postgresql.org/docs/current/errcodes-appendix.html
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";
const UNDEFINED_TABLE: &str = "42P01";

/// Convert sqlx::Error to AppError with structured information
pub fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => {
                let code_str = code.as_ref();
                match code_str {
                    UNIQUE_VIOLATION => AppError::Conflict(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    FOREIGN_KEY_VIOLATION | CHECK_VIOLATION => AppError::Validation(format!(
                        "Constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE => {
                        AppError::Conflict(format!(
                            "Concurrent update, retry later: {} ({})",
                            db_err.message(),
                            code_str
                        ))
                    }
                    QUERY_CANCELED => {
                        AppError::Database(format!("Query canceled: {}", db_err.message()))
                    }
                    UNDEFINED_TABLE => AppError::Config(format!(
                        "Missing table, run migrations first: {}",
                        db_err.message()
                    )),
                    _ => AppError::Database(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            }
            None => AppError::Database(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::RowNotFound => AppError::NotFound("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => AppError::Database(format!("Column not found: {}", col)),
        sqlx::Error::ColumnDecode { index, source } => {
            AppError::Database(format!("Cannot decode column {}: {}", index, source))
        }
        sqlx::Error::PoolTimedOut => {
            AppError::Database("Timed out waiting for a database connection".to_string())
        }
        // Connection, pool, protocol errors
        _ => AppError::Database(err.to_string()),
    }
}
