// Processing Ledger Domain Model

use super::error::{DomainError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Ledger row identifier (assigned by the repository on create)
pub type LedgerId = Uuid;

/// Reason recorded when a failure carries no message of its own
const UNSPECIFIED_FAILURE: &str = "unspecified failure";

/// Stored text must survive any text column: NUL and other control
/// characters (line breaks and tabs aside) become U+FFFD
fn storable_text(text: &str) -> String {
    text.trim()
        .chars()
        .map(|c| match c {
            '\n' | '\t' => c,
            c if c.is_control() => char::REPLACEMENT_CHARACTER,
            c => c,
        })
        .collect()
}

/// Processing status of a ledger row
///
/// `Pending` is initial. `Processed` and `Aborted` are terminal. `Error` is
/// terminal for a run but may be requeued or aborted by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Error,
    Aborted,
}

impl ProcessingStatus {
    pub const ALL: [ProcessingStatus; 4] = [
        ProcessingStatus::Pending,
        ProcessingStatus::Processed,
        ProcessingStatus::Error,
        ProcessingStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "Pending",
            ProcessingStatus::Processed => "Processed",
            ProcessingStatus::Error => "Error",
            ProcessingStatus::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Processed | ProcessingStatus::Aborted)
    }

    /// Allowed transitions. Pending -> {Processed, Error} happens inside a run;
    /// Error -> {Pending, Aborted} only through the retry policy.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processed) | (Pending, Error) | (Error, Pending) | (Error, Aborted)
        )
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        ProcessingStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// Lifecycle columns shared by every ledger shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub status: ProcessingStatus,
    pub external_correlation_id: Option<String>,
    pub error_reason: Option<String>,
    pub retry_count: u8,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

impl ProcessingState {
    /// Fresh Pending state; the repository overwrites timestamps on create
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: ProcessingStatus::Pending,
            external_correlation_id: None,
            error_reason: None,
            retry_count: 0,
            date_created: now,
            date_modified: now,
        }
    }

    fn transition(&mut self, next: ProcessingStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.date_modified = now;
        Ok(())
    }

    /// Pending -> Processed. Keeps a previously stored correlation id when none is produced.
    pub fn mark_processed(
        &mut self,
        external_correlation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(ProcessingStatus::Processed, now)?;
        if let Some(id) = external_correlation_id
            .map(|id| storable_text(&id))
            .filter(|id| !id.is_empty())
        {
            self.external_correlation_id = Some(id);
        }
        self.error_reason = None;
        Ok(())
    }

    /// Pending -> Error, counting the failed attempt
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(ProcessingStatus::Error, now)?;
        let reason = storable_text(&reason.into());
        self.error_reason = Some(if reason.is_empty() {
            UNSPECIFIED_FAILURE.to_string()
        } else {
            reason
        });
        self.retry_count = self.retry_count.saturating_add(1);
        Ok(())
    }

    /// Error -> Pending. Retry count and last error reason are kept for inspection.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ProcessingStatus::Pending, now)
    }

    /// Error -> Aborted
    pub fn abort(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ProcessingStatus::Aborted, now)
    }
}

/// A persisted unit of background work, as seen by the engine.
///
/// Each job family supplies its own shape; the engine only touches the
/// identity and the shared [`ProcessingState`].
pub trait LedgerItem: Clone + Send + Sync + 'static {
    fn id(&self) -> LedgerId;

    /// Set by the repository on create
    fn assign_id(&mut self, id: LedgerId);

    /// What this item represents (e.g. "Opportunity", "User")
    fn entity_type(&self) -> &str;

    /// Pending operation (e.g. "Create", "Delete")
    fn action(&self) -> &str;

    fn processing(&self) -> &ProcessingState;

    fn processing_mut(&mut self) -> &mut ProcessingState;

    fn status(&self) -> ProcessingStatus {
        self.processing().status
    }

    fn retry_count(&self) -> u8 {
        self.processing().retry_count
    }
}

/// Generic ledger row: shared lifecycle columns plus a job-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord<P> {
    pub id: LedgerId,
    pub entity_type: String,
    pub action: String,
    pub payload: P,
    #[serde(flatten)]
    pub processing: ProcessingState,
}

impl<P> LedgerRecord<P> {
    /// Create an unsaved Pending record (nil id until persisted)
    pub fn new(
        entity_type: impl Into<String>,
        action: impl Into<String>,
        payload: P,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            entity_type: entity_type.into(),
            action: action.into(),
            payload,
            processing: ProcessingState::pending(now),
        }
    }
}

impl<P> LedgerItem for LedgerRecord<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn id(&self) -> LedgerId {
        self.id
    }

    fn assign_id(&mut self, id: LedgerId) {
        self.id = id;
    }

    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn action(&self) -> &str {
        &self.action
    }

    fn processing(&self) -> &ProcessingState {
        &self.processing
    }

    fn processing_mut(&mut self) -> &mut ProcessingState {
        &mut self.processing
    }
}
