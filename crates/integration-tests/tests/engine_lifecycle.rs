//! Engine lifecycle across runs and instances, on the in-memory adapters

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetbatch_core::application::{
    shutdown_channel, DistributedLockService, JobHost, JobOptions, RetryOptions, RunOutcome,
    ScheduleOptions, ScheduledProcessor,
};
use fleetbatch_core::domain::{LedgerId, LedgerItem, LedgerRecord, ProcessingStatus};
use fleetbatch_core::port::batch_action::mocks::FnAction;
use fleetbatch_core::port::id_provider::mocks::SequentialIdProvider;
use fleetbatch_core::port::ledger_repository::mocks::InMemoryLedger;
use fleetbatch_core::port::lock_store::mocks::InMemoryLockStore;
use fleetbatch_core::port::time_provider::mocks::ManualClock;
use fleetbatch_core::port::{ActionError, ActionResult, BatchAction, LedgerRepository, TimeProvider};
use serde_json::{json, Value};

type Item = LedgerRecord<Value>;

struct Fleet {
    clock: Arc<ManualClock>,
    ledger: InMemoryLedger<Item>,
    store: Arc<InMemoryLockStore>,
}

impl Fleet {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let ledger = InMemoryLedger::with_providers(
            "wallet_creation",
            clock.clone(),
            Arc::new(SequentialIdProvider::default()),
        );
        let store = Arc::new(InMemoryLockStore::new(clock.clone()));
        Self { clock, ledger, store }
    }

    async fn seed(&self, names: &[&str]) -> Vec<LedgerId> {
        let mut ids = Vec::new();
        for name in names {
            let item = Item::new("User", "CreateWallet", json!({ "user": name }), self.clock.now());
            ids.push(self.ledger.create(item).await.unwrap().id);
            self.clock.advance(Duration::from_millis(1));
        }
        ids
    }

    /// A processor as one fleet instance would build it
    fn instance(
        &self,
        job: JobOptions,
        action: Arc<dyn BatchAction<Item>>,
        holder: &str,
    ) -> ScheduledProcessor<Item> {
        let locks = Arc::new(DistributedLockService::with_holder(
            self.store.clone(),
            self.clock.clone(),
            Duration::from_millis(5),
            holder,
        ));
        ScheduledProcessor::new(
            job,
            ScheduleOptions::default(),
            Arc::new(self.ledger.clone()),
            action,
            locks,
            self.clock.clone(),
        )
        .unwrap()
    }

    fn row(&self, user: &str) -> Item {
        self.ledger
            .snapshot()
            .into_iter()
            .find(|item| item.payload["user"] == user)
            .unwrap()
    }
}

fn user_of(item: &Item) -> &str {
    item.payload["user"].as_str().unwrap_or_default()
}

/// BatchSize 2 over A..E with B failing: three batches, four Processed, B in Error
#[tokio::test]
async fn test_batches_until_drained() {
    let fleet = Fleet::new();
    fleet.seed(&["A", "B", "C", "D", "E"]).await;

    let action = Arc::new(FnAction::new(|item: &Item| match user_of(item) {
        "B" => Err(ActionError::Rejected("wallet exists".to_string())),
        user => Ok(ActionResult::with_correlation_id(format!("wallet-{}", user))),
    }));
    let processor = fleet.instance(JobOptions::new("wallet-creation", 2), action.clone(), "host-a:1");

    let report = processor.run().await;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.batches, 3);
    assert_eq!((report.processed, report.failed), (4, 1));
    assert_eq!(action.calls().len(), 5);

    for user in ["A", "C", "D", "E"] {
        let row = fleet.row(user);
        assert_eq!(row.status(), ProcessingStatus::Processed);
        assert_eq!(
            row.processing.external_correlation_id.as_deref(),
            Some(format!("wallet-{}", user).as_str())
        );
    }
    let b = fleet.row("B");
    assert_eq!(b.status(), ProcessingStatus::Error);
    assert_eq!(b.retry_count(), 1);
    assert!(fleet.ledger.locked_ids().is_empty());
}

/// Error -> requeue -> Error -> abort, one transition per run
#[tokio::test]
async fn test_retry_cap_across_runs() {
    let fleet = Fleet::new();
    fleet.seed(&["good", "bad"]).await;

    let action = Arc::new(FnAction::new(|item: &Item| match user_of(item) {
        "bad" => Err(ActionError::Unavailable("wallet provider down".to_string())),
        _ => Ok(ActionResult::default()),
    }));
    let job = JobOptions::new("wallet-creation", 10).with_retry(RetryOptions {
        max_retry_attempts: Some(1),
        requeue_on_run: true,
    });
    let processor = fleet.instance(job, action.clone(), "host-a:1");

    // Run 1: first attempt fails
    let first = processor.run().await;
    assert_eq!((first.processed, first.failed, first.requeued, first.aborted), (1, 1, 0, 0));
    assert_eq!(fleet.row("bad").retry_count(), 1);

    // Run 2: one retry allowed, fails again
    fleet.clock.advance(Duration::from_secs(60));
    let second = processor.run().await;
    assert_eq!((second.processed, second.failed, second.requeued, second.aborted), (0, 1, 1, 0));
    assert_eq!(fleet.row("bad").retry_count(), 2);

    // Run 3: cap reached, aborted without another attempt
    fleet.clock.advance(Duration::from_secs(60));
    let third = processor.run().await;
    assert_eq!(third.outcome, RunOutcome::Drained);
    assert_eq!((third.processed, third.failed, third.requeued, third.aborted), (0, 0, 0, 1));
    assert_eq!(fleet.row("bad").status(), ProcessingStatus::Aborted);

    // Run 4: nothing left to do
    let fourth = processor.run().await;
    assert_eq!(fourth.mutations(), 0);

    let attempts = action.calls().iter().filter(|id| **id == fleet.row("bad").id).count();
    assert_eq!(attempts, 2);
    assert_eq!(fleet.row("good").status(), ProcessingStatus::Processed);
}

/// Only one of several instances triggered together does any work
#[tokio::test]
async fn test_simultaneous_triggers_across_instances() {
    let fleet = Fleet::new();
    fleet.seed(&["A", "B", "C"]).await;

    let action = Arc::new(FnAction::new(|_: &Item| Ok(ActionResult::default())));
    let instances: Vec<_> = (0..4)
        .map(|i| {
            Arc::new(fleet.instance(
                JobOptions::new("wallet-creation", 10),
                action.clone(),
                &format!("host-{}:1", i),
            ))
        })
        .collect();

    // Hold the lock as a fifth instance would while the others trigger
    let busy = DistributedLockService::with_holder(
        fleet.store.clone(),
        fleet.clock.clone(),
        Duration::from_millis(5),
        "host-busy:1",
    );
    assert!(busy
        .try_acquire_lock("wallet-creation", Duration::from_secs(3600))
        .await
        .unwrap());

    let mut handles = Vec::new();
    for instance in &instances {
        let instance = instance.clone();
        handles.push(tokio::spawn(async move { instance.run().await }));
    }
    for handle in handles {
        let report = handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::LockDenied);
        assert_eq!(report.mutations(), 0);
    }
    assert!(action.calls().is_empty());

    // Once the holder is done the next trigger proceeds
    busy.release_lock("wallet-creation").await;
    let report = instances[0].run().await;
    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!(report.processed, 3);
}

/// Action that yields between items so concurrent runs interleave
struct SlowAction {
    seen: Mutex<HashMap<LedgerId, usize>>,
}

#[async_trait]
impl BatchAction<Item> for SlowAction {
    async fn execute(&self, item: &Item) -> Result<ActionResult, ActionError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        *self
            .seen
            .lock()
            .unwrap()
            .entry(item.id)
            .or_insert(0) += 1;
        Ok(ActionResult::default())
    }
}

/// Two jobs on one ledger under different locks claim disjoint rows
#[tokio::test]
async fn test_job_host_with_two_lock_identities_shares_the_ledger() {
    let fleet = Fleet::new();
    let names: Vec<String> = (0..40).map(|i| format!("user-{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    fleet.seed(&refs).await;

    let action = Arc::new(SlowAction {
        seen: Mutex::new(HashMap::new()),
    });
    let west = fleet.instance(
        JobOptions::new("wallet-creation-west", 3),
        action.clone(),
        "host-west:1",
    );
    let east = fleet.instance(
        JobOptions::new("wallet-creation-east", 3),
        action.clone(),
        "host-east:1",
    );

    let mut host = JobHost::new();
    host.register(Arc::new(west), Duration::from_millis(20))
        .register(Arc::new(east), Duration::from_millis(20));

    let (sender, token) = shutdown_channel();
    let handle = tokio::spawn(host.run(token));

    let ledger = fleet.ledger.clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        while ledger.count_by_status(ProcessingStatus::Pending).await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ledger never drained");

    sender.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("host did not stop")
        .unwrap();

    let seen = action.seen.lock().unwrap();
    assert_eq!(seen.len(), 40);
    assert!(seen.values().all(|count| *count == 1), "an item was processed twice");
    assert_eq!(
        fleet.ledger.count_by_status(ProcessingStatus::Processed).await.unwrap(),
        40
    );
    assert!(fleet.ledger.locked_ids().is_empty());
}

/// A panicking action costs one item, never the run or the lock
#[tokio::test]
async fn test_panicking_action_is_isolated() {
    let fleet = Fleet::new();
    fleet.seed(&["A", "boom", "C"]).await;

    let action = Arc::new(FnAction::new(|item: &Item| {
        if user_of(item) == "boom" {
            panic!("wallet provider returned garbage");
        }
        Ok(ActionResult::default())
    }));
    let processor = fleet.instance(JobOptions::new("wallet-creation", 10), action, "host-a:1");

    let report = processor.run().await;

    assert_eq!(report.outcome, RunOutcome::Drained);
    assert_eq!((report.processed, report.failed), (2, 1));
    let boom = fleet.row("boom");
    assert_eq!(boom.status(), ProcessingStatus::Error);
    assert!(boom
        .processing
        .error_reason
        .as_deref()
        .unwrap_or_default()
        .contains("wallet provider returned garbage"));
    assert_eq!(
        fleet
            .store
            .holder_of(&DistributedLockService::lock_key("wallet-creation").unwrap()),
        None
    );
}
