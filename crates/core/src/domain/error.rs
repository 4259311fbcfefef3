// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid processing status transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown processing status: {0}")]
    UnknownStatus(String),

    #[error("Unsupported lock mode: {0}")]
    UnsupportedLockMode(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
