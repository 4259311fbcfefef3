// Scheduled Processor - lock, claim, act, write back, release

pub mod constants;
mod panic_guard;
mod report;
mod shutdown;

pub use panic_guard::{execute_guarded, PanicGuardResult};
pub use report::{RunOutcome, RunReport};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::lock_service::DistributedLockService;
use crate::application::options::{JobOptions, ScheduleOptions};
use crate::application::retry::RetryPolicy;
use crate::domain::{LedgerId, LedgerItem};
use crate::error::Result;
use crate::port::{
    ActionError, BatchAction, ClaimedBatch, LedgerClaim, LedgerRepository, TimeProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One job's batch loop over one ledger.
///
/// Each run takes the job's distributed lock, claims Pending rows in batches
/// with SkipLocked, invokes the business action per row and writes the result
/// back inside the claim. The run ends when the claim comes back empty, the
/// run budget is spent or shutdown is requested (both checked after every
/// item). The lock is released on every path once it was acquired.
pub struct ScheduledProcessor<T: LedgerItem> {
    job: JobOptions,
    schedule: ScheduleOptions,
    ledger: Arc<dyn LedgerRepository<T>>,
    action: Arc<dyn BatchAction<T>>,
    locks: Arc<DistributedLockService>,
    time_provider: Arc<dyn TimeProvider>,
}

impl<T: LedgerItem> ScheduledProcessor<T> {
    pub fn new(
        job: JobOptions,
        schedule: ScheduleOptions,
        ledger: Arc<dyn LedgerRepository<T>>,
        action: Arc<dyn BatchAction<T>>,
        locks: Arc<DistributedLockService>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        job.validate()?;
        schedule.validate()?;
        Ok(Self {
            job,
            schedule,
            ledger,
            action,
            locks,
            time_provider,
        })
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn options(&self) -> &JobOptions {
        &self.job
    }

    /// Run budget and lock TTL (budget plus buffer)
    pub fn run_window(&self) -> (Duration, Duration) {
        let budget = self.job.max_interval(&self.schedule);
        (budget, budget + self.schedule.lock_duration_buffer())
    }

    /// One run. Never returns an error: failures end up in the report and the log.
    pub async fn run(&self) -> RunReport {
        self.run_inner(None).await
    }

    /// Like [`run`](Self::run), but stops after the current item once `shutdown` fires
    pub async fn run_until_shutdown(&self, shutdown: &ShutdownToken) -> RunReport {
        self.run_inner(Some(shutdown)).await
    }

    async fn run_inner(&self, shutdown: Option<&ShutdownToken>) -> RunReport {
        let mut report = RunReport::new(self.job.name.clone());
        let lock_identifier = self.job.lock_identifier();
        let (budget, lock_duration) = self.run_window();
        let started = self.time_provider.now_millis();
        let execute_until =
            started.saturating_add(i64::try_from(budget.as_millis()).unwrap_or(i64::MAX));

        match self.locks.try_acquire_lock(lock_identifier, lock_duration).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    job = %self.job.name,
                    lock_identifier,
                    "Job already running on another instance, skipping this trigger"
                );
                report.outcome = RunOutcome::LockDenied;
                return report;
            }
            Err(e) => {
                error!(
                    job = %self.job.name,
                    lock_identifier,
                    error = %e,
                    "Could not reach lock backend, skipping this trigger"
                );
                report.outcome = RunOutcome::LockUnavailable;
                report.error = Some(e.to_string());
                return report;
            }
        }

        info!(
            job = %self.job.name,
            ledger = self.ledger.name(),
            batch_size = self.job.batch_size,
            budget_minutes = budget.as_secs() / 60,
            "Run started"
        );

        match execute_guarded(self.process_until(execute_until, shutdown, &mut report)).await {
            PanicGuardResult::Success(Ok(outcome)) => report.outcome = outcome,
            PanicGuardResult::Success(Err(e)) => {
                error!(job = %self.job.name, error = %e, "Run failed");
                report.outcome = RunOutcome::Failed;
                report.error = Some(e.to_string());
            }
            PanicGuardResult::Panicked(msg) => {
                error!(job = %self.job.name, panic_msg = %msg, "Run panicked");
                report.outcome = RunOutcome::Failed;
                report.error = Some(format!("run panicked: {}", msg));
            }
        }

        self.locks.release_lock(lock_identifier).await;

        info!(
            job = %self.job.name,
            outcome = %report.outcome,
            batches = report.batches,
            processed = report.processed,
            failed = report.failed,
            write_failures = report.write_failures,
            requeued = report.requeued,
            aborted = report.aborted,
            "Run finished"
        );
        report
    }

    async fn process_until(
        &self,
        execute_until: i64,
        shutdown: Option<&ShutdownToken>,
        report: &mut RunReport,
    ) -> Result<RunOutcome> {
        if self.job.retry.requeue_on_run {
            let policy = RetryPolicy::new(self.job.retry.max_retry_attempts, self.time_provider.clone());
            let (requeued, aborted) = policy.sweep(self.ledger.as_ref()).await?;
            report.requeued = requeued;
            report.aborted = aborted;
        }

        let stop_requested = || shutdown.is_some_and(ShutdownToken::is_shutdown);

        // Items this run already tried and must not claim again
        let mut skip_ids: Vec<LedgerId> = Vec::new();

        while self.time_provider.now_millis() < execute_until {
            if stop_requested() {
                info!(job = %self.job.name, "Shutdown requested, leaving remaining items for the next start");
                return Ok(RunOutcome::ShutdownRequested);
            }

            let ClaimedBatch { items, mut claim } = self
                .ledger
                .list_pending_for_claim(self.job.batch_size, &skip_ids)
                .await?;

            if items.is_empty() {
                claim.commit().await?;
                debug!(job = %self.job.name, "No pending items left");
                return Ok(RunOutcome::Drained);
            }

            report.batches += 1;
            debug!(job = %self.job.name, batch = report.batches, size = items.len(), "Claimed batch");

            let mut tally = BatchTally::default();
            let mut cut_short = false;
            for item in items {
                let outcome = self.process_item(item, claim.as_mut(), &mut skip_ids).await;
                tally.record(outcome);
                if self.time_provider.now_millis() >= execute_until || stop_requested() {
                    cut_short = true;
                    break;
                }
            }

            // Unvisited items of a cut-short batch are released untouched
            if let Err(e) = claim.commit().await {
                // Nothing written in this batch landed; those rows stay Pending
                report.write_failures += tally.processed + tally.failed + tally.not_written;
                return Err(e);
            }
            report.processed += tally.processed;
            report.failed += tally.failed;
            report.write_failures += tally.not_written;

            if cut_short && stop_requested() {
                info!(job = %self.job.name, "Shutdown requested, leaving remaining items for the next start");
                return Ok(RunOutcome::ShutdownRequested);
            }
            if cut_short {
                break;
            }
        }

        info!(job = %self.job.name, "Run budget spent, leaving remaining items for the next trigger");
        Ok(RunOutcome::DeadlineReached)
    }

    async fn process_item(
        &self,
        mut item: T,
        claim: &mut dyn LedgerClaim<T>,
        skip_ids: &mut Vec<LedgerId>,
    ) -> ItemOutcome {
        let item_id = item.id();
        info!(
            job = %self.job.name,
            item_id = %item_id,
            entity_type = item.entity_type(),
            action = item.action(),
            "Processing item"
        );

        let outcome = match execute_guarded(self.action.execute(&item)).await {
            PanicGuardResult::Success(result) => result,
            PanicGuardResult::Panicked(msg) => Err(ActionError::Panicked(msg)),
        };

        let now = self.time_provider.now();
        let succeeded = outcome.is_ok();
        let transition = match outcome {
            Ok(result) => item
                .processing_mut()
                .mark_processed(result.external_correlation_id, now),
            Err(e) => {
                warn!(job = %self.job.name, item_id = %item_id, error = %e, "Item failed");
                item.processing_mut().mark_failed(e.to_string(), now)
            }
        };

        if let Err(e) = transition {
            error!(job = %self.job.name, item_id = %item_id, error = %e, "Claimed item was not Pending, leaving it untouched");
            skip_ids.push(item_id);
            return ItemOutcome::NotWritten;
        }

        match claim.write_back(&item).await {
            Ok(_) if succeeded => {
                info!(job = %self.job.name, item_id = %item_id, "Item processed");
                ItemOutcome::Processed
            }
            Ok(_) => {
                skip_ids.push(item_id);
                ItemOutcome::Failed
            }
            Err(e) => {
                error!(
                    job = %self.job.name,
                    item_id = %item_id,
                    error = %e,
                    "Failed to write back item, it stays Pending until the next run"
                );
                skip_ids.push(item_id);
                ItemOutcome::NotWritten
            }
        }
    }
}

/// Result of one item inside a claim, before the claim commits
enum ItemOutcome {
    Processed,
    Failed,
    NotWritten,
}

/// Per-batch counters, folded into the report once the claim commits
#[derive(Default)]
struct BatchTally {
    processed: usize,
    failed: usize,
    not_written: usize,
}

impl BatchTally {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Processed => self.processed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::NotWritten => self.not_written += 1,
        }
    }
}
