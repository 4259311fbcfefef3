// Retry policy for failed ledger rows
use crate::domain::{LedgerItem, LockMode, ProcessingStatus};
use crate::error::Result;
use crate::port::{LedgerFilter, LedgerRepository, TimeProvider};
use std::sync::Arc;
use tracing::{info, warn};

/// What the policy wants done with a row
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Error row with retries left: back to Pending
    Requeue,
    /// Error row past the cap: Aborted
    Abort,
    /// Not an Error row; left alone
    Keep,
}

/// Moves Error rows back to Pending or on to Aborted.
///
/// Never runs inside the claim loop. It is invoked at the start of a run
/// (when the job opts in) or by an operator. Writes are guarded on the row
/// still being Error, so a row that moved on after the read is left alone.
pub struct RetryPolicy {
    max_retry_attempts: Option<u8>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RetryPolicy {
    /// `max_retry_attempts = None` requeues failed rows forever
    pub fn new(max_retry_attempts: Option<u8>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            max_retry_attempts,
            time_provider,
        }
    }

    /// Failed attempts after which a row is aborted
    fn abort_threshold(&self) -> Option<u8> {
        self.max_retry_attempts.map(|max| max.saturating_add(1))
    }

    pub fn decide<T: LedgerItem>(&self, item: &T) -> RetryDecision {
        if item.status() != ProcessingStatus::Error {
            return RetryDecision::Keep;
        }
        match self.abort_threshold() {
            Some(threshold) if item.retry_count() >= threshold => RetryDecision::Abort,
            _ => RetryDecision::Requeue,
        }
    }

    /// Error rows with retries left -> Pending. Returns the number of rows moved.
    pub async fn requeue_failed<T: LedgerItem>(&self, ledger: &dyn LedgerRepository<T>) -> Result<usize> {
        let mut filter = LedgerFilter::with_status(ProcessingStatus::Error);
        if let Some(threshold) = self.abort_threshold() {
            filter = filter.retry_count_below(threshold);
        }

        let rows = ledger.query(&filter, Some(LockMode::Wait)).await?;
        let now = self.time_provider.now();
        let mut requeued = Vec::with_capacity(rows.len());
        for mut row in rows {
            if self.decide(&row) != RetryDecision::Requeue {
                continue;
            }
            row.processing_mut().requeue(now)?;
            requeued.push(row);
        }

        if requeued.is_empty() {
            return Ok(0);
        }
        let count = ledger
            .transition_many(requeued, ProcessingStatus::Error)
            .await?
            .len();
        info!(ledger = ledger.name(), count, "Requeued failed ledger rows");
        Ok(count)
    }

    /// Error rows past the cap -> Aborted. No-op when uncapped.
    pub async fn abort_exhausted<T: LedgerItem>(&self, ledger: &dyn LedgerRepository<T>) -> Result<usize> {
        let Some(threshold) = self.abort_threshold() else {
            return Ok(0);
        };

        let filter = LedgerFilter::with_status(ProcessingStatus::Error).retry_count_at_least(threshold);
        let rows = ledger.query(&filter, Some(LockMode::Wait)).await?;
        let now = self.time_provider.now();
        let mut aborted = Vec::with_capacity(rows.len());
        for mut row in rows {
            if self.decide(&row) != RetryDecision::Abort {
                continue;
            }
            row.processing_mut().abort(now)?;
            aborted.push(row);
        }

        if aborted.is_empty() {
            return Ok(0);
        }
        let count = ledger
            .transition_many(aborted, ProcessingStatus::Error)
            .await?
            .len();
        warn!(
            ledger = ledger.name(),
            count,
            threshold,
            "Aborted ledger rows that exhausted their retries"
        );
        Ok(count)
    }

    /// Abort exhausted rows, then requeue the rest. Returns (requeued, aborted).
    pub async fn sweep<T: LedgerItem>(&self, ledger: &dyn LedgerRepository<T>) -> Result<(usize, usize)> {
        let aborted = self.abort_exhausted(ledger).await?;
        let requeued = self.requeue_failed(ledger).await?;
        Ok((requeued, aborted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LedgerRecord;
    use crate::port::ledger_repository::mocks::InMemoryLedger;
    use crate::port::time_provider::SystemTimeProvider;

    type Row = LedgerRecord<String>;

    async fn seed_failed(ledger: &InMemoryLedger<Row>, retry_counts: &[u8]) {
        let now = chrono::Utc::now();
        for (i, count) in retry_counts.iter().enumerate() {
            let mut row = ledger
                .create(Row::new("User", "Create", format!("row-{}", i), now))
                .await
                .unwrap();
            row.processing_mut().status = ProcessingStatus::Error;
            row.processing_mut().retry_count = *count;
            ledger.update(row).await.unwrap();
        }
    }

    fn policy(max: Option<u8>) -> RetryPolicy {
        RetryPolicy::new(max, Arc::new(SystemTimeProvider))
    }

    fn count(ledger: &InMemoryLedger<Row>, status: ProcessingStatus) -> usize {
        ledger.snapshot().iter().filter(|row| row.status() == status).count()
    }

    #[test]
    fn test_decide() {
        let policy = policy(Some(2));
        let mut row = Row::new("User", "Create", String::new(), chrono::Utc::now());
        assert_eq!(policy.decide(&row), RetryDecision::Keep);

        row.processing.status = ProcessingStatus::Error;
        row.processing.retry_count = 2;
        assert_eq!(policy.decide(&row), RetryDecision::Requeue);

        row.processing.retry_count = 3;
        assert_eq!(policy.decide(&row), RetryDecision::Abort);
    }

    #[tokio::test]
    async fn test_sweep_respects_cap() {
        let ledger = InMemoryLedger::<Row>::new("wallet_creation");
        seed_failed(&ledger, &[1, 2, 3, 5]).await;

        let (requeued, aborted) = policy(Some(2)).sweep(&ledger).await.unwrap();

        assert_eq!((requeued, aborted), (2, 2));
        assert_eq!(count(&ledger, ProcessingStatus::Pending), 2);
        assert_eq!(count(&ledger, ProcessingStatus::Aborted), 2);
        // Requeued rows keep their history
        assert!(ledger
            .snapshot()
            .iter()
            .filter(|row| row.status() == ProcessingStatus::Pending)
            .all(|row| row.retry_count() > 0));
    }

    #[tokio::test]
    async fn test_uncapped_policy_never_aborts() {
        let ledger = InMemoryLedger::<Row>::new("downloads");
        seed_failed(&ledger, &[1, 200]).await;

        let policy = policy(None);
        assert_eq!(policy.abort_exhausted(&ledger).await.unwrap(), 0);
        assert_eq!(policy.requeue_failed(&ledger).await.unwrap(), 2);
        assert_eq!(count(&ledger, ProcessingStatus::Pending), 2);
    }

    #[tokio::test]
    async fn test_zero_cap_aborts_after_first_failure() {
        let ledger = InMemoryLedger::<Row>::new("partner_sharing");
        seed_failed(&ledger, &[1]).await;

        let (requeued, aborted) = policy(Some(0)).sweep(&ledger).await.unwrap();
        assert_eq!((requeued, aborted), (0, 1));
    }

    #[tokio::test]
    async fn test_requeue_never_overwrites_a_row_that_moved_on() {
        let ledger = InMemoryLedger::<Row>::new("wallet_creation");
        seed_failed(&ledger, &[1, 1]).await;
        // Another operator requeues and a processor finishes the first row
        // between this policy's read and its write
        let racing = RacingLedger {
            inner: ledger.clone(),
        };

        let requeued = policy(None).requeue_failed(&racing).await.unwrap();

        assert_eq!(requeued, 1);
        assert_eq!(count(&ledger, ProcessingStatus::Processed), 1);
        assert_eq!(count(&ledger, ProcessingStatus::Pending), 1);
        let finished = ledger
            .snapshot()
            .into_iter()
            .find(|row| row.status() == ProcessingStatus::Processed)
            .unwrap();
        assert_eq!(finished.processing.external_correlation_id.as_deref(), Some("ext-0"));
    }

    #[tokio::test]
    async fn test_sweep_on_clean_ledger_is_noop() {
        let ledger = InMemoryLedger::<Row>::new("partner_sharing");
        assert_eq!(policy(Some(3)).sweep(&ledger).await.unwrap(), (0, 0));
    }

    /// Finishes the first returned row right after every query
    struct RacingLedger {
        inner: InMemoryLedger<Row>,
    }

    #[async_trait::async_trait]
    impl LedgerRepository<Row> for RacingLedger {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn query(&self, filter: &LedgerFilter, lock_mode: Option<LockMode>) -> Result<Vec<Row>> {
            let rows = self.inner.query(filter, lock_mode).await?;
            if let Some(first) = rows.first() {
                let mut moved = first.clone();
                let now = chrono::Utc::now();
                moved.processing.requeue(now)?;
                moved.processing.mark_processed(Some("ext-0".to_string()), now)?;
                self.inner.update(moved).await?;
            }
            Ok(rows)
        }

        async fn find_by_id(&self, id: crate::domain::LedgerId) -> Result<Option<Row>> {
            self.inner.find_by_id(id).await
        }

        async fn create(&self, item: Row) -> Result<Row> {
            self.inner.create(item).await
        }

        async fn create_many(&self, items: Vec<Row>) -> Result<Vec<Row>> {
            self.inner.create_many(items).await
        }

        async fn update(&self, item: Row) -> Result<Row> {
            self.inner.update(item).await
        }

        async fn update_many(&self, items: Vec<Row>) -> Result<Vec<Row>> {
            self.inner.update_many(items).await
        }

        async fn transition_many(&self, items: Vec<Row>, expected: ProcessingStatus) -> Result<Vec<Row>> {
            self.inner.transition_many(items, expected).await
        }

        async fn list_pending_for_claim(
            &self,
            batch_size: usize,
            exclude_ids: &[crate::domain::LedgerId],
        ) -> Result<crate::port::ClaimedBatch<Row>> {
            self.inner.list_pending_for_claim(batch_size, exclude_ids).await
        }

        async fn count_by_status(&self, status: ProcessingStatus) -> Result<i64> {
            self.inner.count_by_status(status).await
        }
    }
}
