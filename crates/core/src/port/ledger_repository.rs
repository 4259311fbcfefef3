// Processing Ledger Repository Port (Interface)

use crate::domain::{LedgerId, LedgerItem, LockMode, ProcessingStatus};
use crate::error::Result;
use crate::port::LedgerClaim;
use async_trait::async_trait;

/// Row selection for ad-hoc ledger queries (ordered by creation time, then id)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    /// Empty means any status
    pub statuses: Vec<ProcessingStatus>,
    pub exclude_ids: Vec<LedgerId>,
    pub retry_count_at_least: Option<u8>,
    pub retry_count_below: Option<u8>,
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn with_status(status: ProcessingStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn excluding(mut self, ids: &[LedgerId]) -> Self {
        self.exclude_ids.extend_from_slice(ids);
        self
    }

    pub fn retry_count_at_least(mut self, count: u8) -> Self {
        self.retry_count_at_least = Some(count);
        self
    }

    pub fn retry_count_below(mut self, count: u8) -> Self {
        self.retry_count_below = Some(count);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process evaluation (limit excluded)
    pub fn matches<T: LedgerItem>(&self, item: &T) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&item.status()))
            && !self.exclude_ids.contains(&item.id())
            && self
                .retry_count_at_least
                .map_or(true, |min| item.retry_count() >= min)
            && self
                .retry_count_below
                .map_or(true, |max| item.retry_count() < max)
    }
}

/// Pending rows claimed for exclusive local processing, plus the transaction holding their locks
pub struct ClaimedBatch<T: LedgerItem> {
    pub items: Vec<T>,
    pub claim: Box<dyn LedgerClaim<T>>,
}

/// Repository interface for one ledger family
#[async_trait]
pub trait LedgerRepository<T: LedgerItem>: Send + Sync {
    /// Ledger (table) name, used for logging
    fn name(&self) -> &str;

    /// Ordered rows matching the filter, optionally under a row lock
    async fn query(&self, filter: &LedgerFilter, lock_mode: Option<LockMode>) -> Result<Vec<T>>;

    /// Find row by ID
    async fn find_by_id(&self, id: LedgerId) -> Result<Option<T>>;

    /// Assign id and timestamps, persist, return the stored row
    async fn create(&self, item: T) -> Result<T>;

    /// Batch create (empty input is a validation error)
    async fn create_many(&self, items: Vec<T>) -> Result<Vec<T>>;

    /// Rewrite mutable columns; `AppError::NotFound` if the id no longer exists
    async fn update(&self, item: T) -> Result<T>;

    /// Batch update in one transaction (empty input is a validation error)
    async fn update_many(&self, items: Vec<T>) -> Result<Vec<T>>;

    /// Batch status transition in one transaction. Only rows whose stored
    /// status still equals `expected` are written; the others are skipped
    /// and left out of the result.
    async fn transition_many(&self, items: Vec<T>, expected: ProcessingStatus) -> Result<Vec<T>>;

    /// Batch Claim Query: up to `batch_size` Pending rows, oldest first,
    /// skipping `exclude_ids` and any row locked by another in-flight claim.
    async fn list_pending_for_claim(
        &self,
        batch_size: usize,
        exclude_ids: &[LedgerId],
    ) -> Result<ClaimedBatch<T>>;

    /// Count rows by status
    async fn count_by_status(&self, status: ProcessingStatus) -> Result<i64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use crate::port::id_provider::{mocks::SequentialIdProvider, IdProvider};
    use crate::port::time_provider::{SystemTimeProvider, TimeProvider};
    use crate::port::Transaction;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::Notify;

    struct LedgerState<T> {
        rows: Vec<T>,
        locked: HashSet<LedgerId>,
        failing_writes: HashSet<LedgerId>,
        failing_commits: bool,
    }

    /// In-memory ledger with SkipLocked/Wait semantics over claim-held row locks.
    ///
    /// Clones share the same rows, so two processors built on clones behave
    /// like two instances pointed at one database.
    pub struct InMemoryLedger<T: LedgerItem> {
        name: String,
        state: Arc<Mutex<LedgerState<T>>>,
        released: Arc<Notify>,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
    }

    impl<T: LedgerItem> Clone for InMemoryLedger<T> {
        fn clone(&self) -> Self {
            Self {
                name: self.name.clone(),
                state: Arc::clone(&self.state),
                released: Arc::clone(&self.released),
                time_provider: Arc::clone(&self.time_provider),
                id_provider: Arc::clone(&self.id_provider),
            }
        }
    }

    impl<T: LedgerItem> InMemoryLedger<T> {
        pub fn new(name: impl Into<String>) -> Self {
            Self::with_providers(
                name,
                Arc::new(SystemTimeProvider),
                Arc::new(SequentialIdProvider::default()),
            )
        }

        pub fn with_providers(
            name: impl Into<String>,
            time_provider: Arc<dyn TimeProvider>,
            id_provider: Arc<dyn IdProvider>,
        ) -> Self {
            Self {
                name: name.into(),
                state: Arc::new(Mutex::new(LedgerState {
                    rows: Vec::new(),
                    locked: HashSet::new(),
                    failing_writes: HashSet::new(),
                    failing_commits: false,
                })),
                released: Arc::new(Notify::new()),
                time_provider,
                id_provider,
            }
        }

        /// Make every future write-back of this row fail like a lost connection
        pub fn fail_writes_for(&self, id: LedgerId) {
            self.lock_state().failing_writes.insert(id);
        }

        /// Make every future claim commit fail; its write-backs are rolled back
        pub fn fail_commits(&self) {
            self.lock_state().failing_commits = true;
        }

        /// Ids currently held by open claims
        pub fn locked_ids(&self) -> Vec<LedgerId> {
            self.lock_state().locked.iter().copied().collect()
        }

        /// Every row, in creation order
        pub fn snapshot(&self) -> Vec<T> {
            self.lock_state().rows.clone()
        }

        fn lock_state(&self) -> MutexGuard<'_, LedgerState<T>> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn select(state: &LedgerState<T>, filter: &LedgerFilter) -> Vec<T> {
            let mut rows: Vec<T> = state
                .rows
                .iter()
                .filter(|row| filter.matches(*row))
                .cloned()
                .collect();
            rows.sort_by_key(|row| (row.processing().date_created, row.id()));
            if let Some(limit) = filter.limit {
                rows.truncate(limit);
            }
            rows
        }

        fn stamp_update(state: &mut LedgerState<T>, item: &T, now: chrono::DateTime<chrono::Utc>) -> Result<T> {
            let row = state
                .rows
                .iter_mut()
                .find(|row| row.id() == item.id())
                .ok_or_else(|| AppError::NotFound(format!("Ledger row {} not found", item.id())))?;

            let date_created = row.processing().date_created;
            let mut updated = item.clone();
            updated.processing_mut().date_created = date_created;
            updated.processing_mut().date_modified = now;
            *row = updated.clone();
            Ok(updated)
        }
    }

    #[async_trait]
    impl<T: LedgerItem> LedgerRepository<T> for InMemoryLedger<T> {
        fn name(&self) -> &str {
            &self.name
        }

        async fn query(&self, filter: &LedgerFilter, lock_mode: Option<LockMode>) -> Result<Vec<T>> {
            loop {
                let released = self.released.notified();
                {
                    let state = self.lock_state();
                    let rows = Self::select(&state, &LedgerFilter { limit: None, ..filter.clone() });
                    let blocked = rows.iter().any(|row| state.locked.contains(&row.id()));

                    match lock_mode {
                        Some(LockMode::Wait) if blocked => {}
                        Some(LockMode::SkipLocked) => {
                            let mut rows: Vec<T> = rows
                                .into_iter()
                                .filter(|row| !state.locked.contains(&row.id()))
                                .collect();
                            if let Some(limit) = filter.limit {
                                rows.truncate(limit);
                            }
                            return Ok(rows);
                        }
                        _ => return Ok(Self::select(&state, filter)),
                    }
                }
                released.await;
            }
        }

        async fn find_by_id(&self, id: LedgerId) -> Result<Option<T>> {
            Ok(self.lock_state().rows.iter().find(|row| row.id() == id).cloned())
        }

        async fn create(&self, mut item: T) -> Result<T> {
            let now = self.time_provider.now();
            item.assign_id(self.id_provider.generate_id());
            item.processing_mut().date_created = now;
            item.processing_mut().date_modified = now;
            self.lock_state().rows.push(item.clone());
            Ok(item)
        }

        async fn create_many(&self, items: Vec<T>) -> Result<Vec<T>> {
            if items.is_empty() {
                return Err(AppError::Validation("No ledger items to create".to_string()));
            }
            let mut created = Vec::with_capacity(items.len());
            for item in items {
                created.push(self.create(item).await?);
            }
            Ok(created)
        }

        async fn update(&self, item: T) -> Result<T> {
            let now = self.time_provider.now();
            let mut state = self.lock_state();
            Self::stamp_update(&mut state, &item, now)
        }

        async fn update_many(&self, items: Vec<T>) -> Result<Vec<T>> {
            if items.is_empty() {
                return Err(AppError::Validation("No ledger items to update".to_string()));
            }
            let now = self.time_provider.now();
            let mut state = self.lock_state();
            // All-or-nothing, like the single transaction of a real store
            if let Some(missing) = items
                .iter()
                .find(|item| !state.rows.iter().any(|row| row.id() == item.id()))
            {
                return Err(AppError::NotFound(format!("Ledger row {} not found", missing.id())));
            }
            items
                .iter()
                .map(|item| Self::stamp_update(&mut state, item, now))
                .collect()
        }

        async fn transition_many(&self, items: Vec<T>, expected: ProcessingStatus) -> Result<Vec<T>> {
            if items.is_empty() {
                return Err(AppError::Validation("No ledger items to update".to_string()));
            }
            let now = self.time_provider.now();
            let mut state = self.lock_state();
            let mut updated = Vec::with_capacity(items.len());
            for item in &items {
                let current = state.rows.iter().find(|row| row.id() == item.id()).map(|row| row.status());
                if current == Some(expected) {
                    updated.push(Self::stamp_update(&mut state, item, now)?);
                }
            }
            Ok(updated)
        }

        async fn list_pending_for_claim(
            &self,
            batch_size: usize,
            exclude_ids: &[LedgerId],
        ) -> Result<ClaimedBatch<T>> {
            if batch_size == 0 {
                return Err(AppError::Validation("Batch size must be greater than zero".to_string()));
            }

            let filter = LedgerFilter::with_status(ProcessingStatus::Pending)
                .excluding(exclude_ids)
                .limit(batch_size);

            let mut state = self.lock_state();
            let mut items: Vec<T> = Self::select(&state, &LedgerFilter { limit: None, ..filter })
                .into_iter()
                .filter(|row| !state.locked.contains(&row.id()))
                .collect();
            items.truncate(batch_size);

            let ids: Vec<LedgerId> = items.iter().map(|item| item.id()).collect();
            state.locked.extend(ids.iter().copied());

            Ok(ClaimedBatch {
                items,
                claim: Box::new(InMemoryClaim {
                    ledger: self.clone(),
                    ids,
                    originals: Vec::new(),
                }),
            })
        }

        async fn count_by_status(&self, status: ProcessingStatus) -> Result<i64> {
            Ok(self
                .lock_state()
                .rows
                .iter()
                .filter(|row| row.status() == status)
                .count() as i64)
        }
    }

    /// Claim over the in-memory ledger. Write-backs are visible at once and
    /// undone unless the claim commits.
    struct InMemoryClaim<T: LedgerItem> {
        ledger: InMemoryLedger<T>,
        ids: Vec<LedgerId>,
        /// Rows as they were before their first write-back
        originals: Vec<T>,
    }

    impl<T: LedgerItem> InMemoryClaim<T> {
        fn finish(&mut self, keep_writes: bool) {
            if self.ids.is_empty() {
                return;
            }
            {
                let mut state = self.ledger.lock_state();
                if !keep_writes {
                    for original in self.originals.drain(..) {
                        if let Some(row) = state.rows.iter_mut().find(|row| row.id() == original.id()) {
                            *row = original;
                        }
                    }
                }
                for id in self.ids.drain(..) {
                    state.locked.remove(&id);
                }
            }
            self.ledger.released.notify_waiters();
        }
    }

    impl<T: LedgerItem> Drop for InMemoryClaim<T> {
        fn drop(&mut self) {
            self.finish(false);
        }
    }

    #[async_trait]
    impl<T: LedgerItem> Transaction for InMemoryClaim<T> {
        async fn commit(mut self: Box<Self>) -> Result<()> {
            if self.ledger.lock_state().failing_commits {
                self.finish(false);
                return Err(AppError::Database("connection lost during commit".to_string()));
            }
            self.finish(true);
            Ok(())
        }

        async fn rollback(mut self: Box<Self>) -> Result<()> {
            self.finish(false);
            Ok(())
        }
    }

    #[async_trait]
    impl<T: LedgerItem> LedgerClaim<T> for InMemoryClaim<T> {
        async fn write_back(&mut self, item: &T) -> Result<T> {
            if !self.ids.contains(&item.id()) {
                return Err(AppError::InvalidState(format!(
                    "Ledger row {} is not part of this claim",
                    item.id()
                )));
            }
            let now = self.ledger.time_provider.now();
            let mut state = self.ledger.lock_state();
            if state.failing_writes.contains(&item.id()) {
                return Err(AppError::Database(format!(
                    "connection reset while updating ledger row {}",
                    item.id()
                )));
            }
            if !self.originals.iter().any(|original| original.id() == item.id()) {
                if let Some(current) = state.rows.iter().find(|row| row.id() == item.id()) {
                    self.originals.push(current.clone());
                }
            }
            InMemoryLedger::stamp_update(&mut state, item, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::InMemoryLedger;
    use super::*;
    use crate::domain::LedgerRecord;
    use crate::error::AppError;
    use crate::port::Transaction;
    use chrono::Utc;
    use std::time::Duration;

    type Record = LedgerRecord<serde_json::Value>;

    fn record(entity: &str) -> Record {
        LedgerRecord::new(entity, "Create", serde_json::json!({}), Utc::now())
    }

    async fn seeded(count: usize) -> (InMemoryLedger<Record>, Vec<Record>) {
        let ledger = InMemoryLedger::new("test_ledger");
        let mut created = Vec::new();
        for i in 0..count {
            created.push(ledger.create(record(&format!("entity-{i}"))).await.unwrap());
        }
        (ledger, created)
    }

    #[tokio::test]
    async fn test_create_assigns_ids() {
        let (ledger, created) = seeded(2).await;
        assert!(!created[0].id.is_nil());
        assert_ne!(created[0].id, created[1].id);
        assert_eq!(ledger.count_by_status(ProcessingStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let (ledger, _) = seeded(5).await;

        let first = ledger.list_pending_for_claim(3, &[]).await.unwrap();
        let second = ledger.list_pending_for_claim(3, &[]).await.unwrap();

        assert_eq!(first.items.len(), 3);
        assert_eq!(second.items.len(), 2);
        for item in &second.items {
            assert!(!first.items.iter().any(|claimed| claimed.id == item.id));
        }

        first.claim.commit().await.unwrap();
        let third = ledger.list_pending_for_claim(3, &[]).await.unwrap();
        assert_eq!(third.items.len(), 3, "committed claim releases its rows");
    }

    #[tokio::test]
    async fn test_claim_respects_exclusions_and_order() {
        let (ledger, created) = seeded(4).await;

        let batch = ledger
            .list_pending_for_claim(2, &[created[0].id])
            .await
            .unwrap();

        let ids: Vec<_> = batch.items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![created[1].id, created[2].id]);
    }

    #[tokio::test]
    async fn test_dropped_claim_releases_locks_and_undoes_writes() {
        let (ledger, _) = seeded(2).await;
        {
            let ClaimedBatch { items, mut claim } = ledger.list_pending_for_claim(2, &[]).await.unwrap();
            assert_eq!(ledger.locked_ids().len(), 2);
            let mut item = items[0].clone();
            item.processing.mark_processed(None, Utc::now()).unwrap();
            claim.write_back(&item).await.unwrap();
        }
        assert!(ledger.locked_ids().is_empty());
        assert_eq!(ledger.count_by_status(ProcessingStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_undoes_writes() {
        let (ledger, _) = seeded(1).await;
        ledger.fail_commits();

        let ClaimedBatch { items, mut claim } = ledger.list_pending_for_claim(1, &[]).await.unwrap();
        let mut item = items[0].clone();
        item.processing.mark_failed("boom", Utc::now()).unwrap();
        claim.write_back(&item).await.unwrap();

        assert!(matches!(claim.commit().await, Err(AppError::Database(_))));
        let stored = ledger.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(stored.processing.status, ProcessingStatus::Pending);
        assert_eq!(stored.processing.retry_count, 0);
        assert!(ledger.locked_ids().is_empty());
    }

    #[tokio::test]
    async fn test_wait_mode_blocks_until_claim_finishes() {
        let (ledger, _) = seeded(1).await;
        let batch = ledger.list_pending_for_claim(1, &[]).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .query(&LedgerFilter::default(), Some(LockMode::Wait))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "Wait mode must block on a claimed row");

        let mut item = batch.items[0].clone();
        let mut claim = batch.claim;
        item.processing.mark_processed(Some("ext-1".to_string()), Utc::now()).unwrap();
        claim.write_back(&item).await.unwrap();
        claim.commit().await.unwrap();

        let rows = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rows[0].processing.status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn test_skip_locked_query_hides_claimed_rows() {
        let (ledger, _) = seeded(3).await;
        let _batch = ledger.list_pending_for_claim(2, &[]).await.unwrap();

        let visible = ledger
            .query(&LedgerFilter::default(), Some(LockMode::SkipLocked))
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);

        let all = ledger.query(&LedgerFilter::default(), None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_transition_skips_rows_that_moved_on() {
        let (ledger, created) = seeded(2).await;
        let mut failed = Vec::new();
        for row in &created {
            let mut row = row.clone();
            row.processing.mark_failed("boom", Utc::now()).unwrap();
            failed.push(ledger.update(row).await.unwrap());
        }

        // Stale snapshot taken while both rows were Error
        let mut stale = failed.clone();
        for row in stale.iter_mut() {
            row.processing.requeue(Utc::now()).unwrap();
        }

        // Meanwhile the first row is requeued and processed by someone else
        let mut moved = failed[0].clone();
        moved.processing.requeue(Utc::now()).unwrap();
        moved.processing.mark_processed(Some("ext-1".to_string()), Utc::now()).unwrap();
        ledger.update(moved).await.unwrap();

        let written = ledger
            .transition_many(stale, ProcessingStatus::Error)
            .await
            .unwrap();

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id, created[1].id);
        let first = ledger.find_by_id(created[0].id).await.unwrap().unwrap();
        assert_eq!(first.processing.status, ProcessingStatus::Processed);
        assert_eq!(first.processing.external_correlation_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let ledger: InMemoryLedger<Record> = InMemoryLedger::new("test_ledger");
        let mut orphan = record("ghost");
        orphan.id = uuid::Uuid::new_v4();

        let err = ledger.update(orphan).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_operations_reject_empty_input() {
        let ledger: InMemoryLedger<Record> = InMemoryLedger::new("test_ledger");
        assert!(matches!(ledger.create_many(vec![]).await, Err(AppError::Validation(_))));
        assert!(matches!(ledger.update_many(vec![]).await, Err(AppError::Validation(_))));
        assert!(matches!(
            ledger.transition_many(vec![], ProcessingStatus::Error).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ledger.list_pending_for_claim(0, &[]).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_by_retry_count() {
        let (ledger, created) = seeded(2).await;
        let mut failed = created[0].clone();
        failed.processing.mark_failed("boom", Utc::now()).unwrap();
        ledger.update(failed).await.unwrap();

        let rows = ledger
            .query(
                &LedgerFilter::with_status(ProcessingStatus::Error).retry_count_at_least(1),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = ledger
            .query(
                &LedgerFilter::with_status(ProcessingStatus::Error).retry_count_below(1),
                None,
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
