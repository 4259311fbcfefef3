// Row lock modes for claim-time queries

use super::error::DomainError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a query treats rows already locked by another in-flight transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Block until the competing transaction releases its row locks.
    Wait,
    /// Silently leave locked rows out of the result.
    SkipLocked,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Wait => write!(f, "wait"),
            LockMode::SkipLocked => write!(f, "skip_locked"),
        }
    }
}

impl FromStr for LockMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(LockMode::Wait),
            "skip_locked" | "skiplocked" => Ok(LockMode::SkipLocked),
            other => Err(DomainError::UnsupportedLockMode(other.to_string())),
        }
    }
}
