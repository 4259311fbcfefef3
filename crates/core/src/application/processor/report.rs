// Run report

use std::fmt;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another instance holds the job lock; nothing was touched
    LockDenied,
    /// The lock backend could not be reached; treated as not acquired
    LockUnavailable,
    /// The claim query came back empty
    Drained,
    /// The run budget ran out with work possibly left
    DeadlineReached,
    /// Shutdown was requested; the run stopped after its current item
    ShutdownRequested,
    /// An unexpected error or panic ended the run early
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::LockDenied => "lock_denied",
            RunOutcome::LockUnavailable => "lock_unavailable",
            RunOutcome::Drained => "drained",
            RunOutcome::DeadlineReached => "deadline_reached",
            RunOutcome::ShutdownRequested => "shutdown_requested",
            RunOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters and outcome of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job: String,
    pub outcome: RunOutcome,
    pub batches: usize,
    pub processed: usize,
    pub failed: usize,
    /// Items whose Processed/Error write never landed (they stay Pending)
    pub write_failures: usize,
    pub requeued: usize,
    pub aborted: usize,
    pub error: Option<String>,
}

impl RunReport {
    pub(crate) fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            outcome: RunOutcome::Failed,
            batches: 0,
            processed: 0,
            failed: 0,
            write_failures: 0,
            requeued: 0,
            aborted: 0,
            error: None,
        }
    }

    /// Ledger writes made by this run
    pub fn mutations(&self) -> usize {
        self.processed + self.failed + self.requeued + self.aborted
    }
}
