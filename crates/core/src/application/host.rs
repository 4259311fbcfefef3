// Job Host - fires each scheduled job on its own cadence

use crate::application::processor::{RunOutcome, RunReport, ScheduledProcessor, ShutdownToken};
use crate::domain::LedgerItem;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Anything the host can trigger
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    /// One run; must not return errors (they belong in the report).
    /// A run in progress should stop early once `shutdown` fires.
    async fn trigger(&self, shutdown: &ShutdownToken) -> RunReport;
}

#[async_trait]
impl<T: LedgerItem> ScheduledJob for ScheduledProcessor<T> {
    fn name(&self) -> &str {
        ScheduledProcessor::name(self)
    }

    async fn trigger(&self, shutdown: &ShutdownToken) -> RunReport {
        self.run_until_shutdown(shutdown).await
    }
}

struct Registration {
    job: Arc<dyn ScheduledJob>,
    every: Duration,
}

/// Local trigger for scheduled jobs.
///
/// Each job gets its own task and timer, so a slow job never delays another.
/// Overlap across the fleet is left to the job's distributed lock; within one
/// host a job never overlaps itself because its loop awaits each run.
#[derive(Default)]
pub struct JobHost {
    jobs: Vec<Registration>,
}

impl JobHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn ScheduledJob>, every: Duration) -> &mut Self {
        self.jobs.push(Registration { job, every });
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every registered job until `shutdown` fires.
    ///
    /// A run that is already in progress when shutdown arrives finishes its
    /// current item, releases its lock and is awaited.
    pub async fn run(self, shutdown: ShutdownToken) {
        if self.jobs.is_empty() {
            warn!("No jobs registered, job host has nothing to do");
            return;
        }

        let mut tasks = JoinSet::new();
        for Registration { job, every } in self.jobs {
            tasks.spawn(trigger_loop(job, every, shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job trigger task ended abnormally");
            }
        }
        info!("Job host stopped");
    }
}

async fn trigger_loop(job: Arc<dyn ScheduledJob>, every: Duration, mut shutdown: ShutdownToken) {
    info!(job = job.name(), interval_secs = every.as_secs(), "Job trigger started");

    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.wait() => break,
        }
        if shutdown.is_shutdown() {
            break;
        }

        let report = job.trigger(&shutdown).await;
        match report.outcome {
            RunOutcome::Failed | RunOutcome::LockUnavailable => warn!(
                job = job.name(),
                outcome = %report.outcome,
                error = report.error.as_deref().unwrap_or("unknown"),
                "Run did not complete, retrying on next trigger"
            ),
            _ => debug!(job = job.name(), outcome = %report.outcome, "Trigger finished"),
        }
    }

    info!(job = job.name(), "Job trigger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::processor::shutdown_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        name: String,
        runs: AtomicUsize,
    }

    impl CountingJob {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            &self.name
        }

        async fn trigger(&self, _shutdown: &ShutdownToken) -> RunReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut report = RunReport::new(self.name.clone());
            report.outcome = RunOutcome::Drained;
            report
        }
    }

    #[tokio::test]
    async fn test_jobs_trigger_until_shutdown() {
        let fast = CountingJob::new("fast");
        let slow = CountingJob::new("slow");

        let mut host = JobHost::new();
        host.register(fast.clone(), Duration::from_millis(10))
            .register(slow.clone(), Duration::from_secs(3600));
        assert_eq!(host.len(), 2);

        let (sender, token) = shutdown_channel();
        let handle = tokio::spawn(host.run(token));

        tokio::time::sleep(Duration::from_millis(60)).await;
        sender.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("host did not stop")
            .unwrap();

        // First tick fires immediately, then every interval
        assert!(fast.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
    }

    /// Stays busy until shutdown fires, like a run mid-batch
    struct BusyJob {
        stopped: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ScheduledJob for BusyJob {
        fn name(&self) -> &str {
            "busy"
        }

        async fn trigger(&self, shutdown: &ShutdownToken) -> RunReport {
            let mut shutdown = shutdown.clone();
            shutdown.wait().await;
            self.stopped.store(true, Ordering::SeqCst);
            let mut report = RunReport::new("busy");
            report.outcome = RunOutcome::ShutdownRequested;
            report
        }
    }

    #[tokio::test]
    async fn test_shutdown_reaches_run_in_progress() {
        let busy = Arc::new(BusyJob {
            stopped: std::sync::atomic::AtomicBool::new(false),
        });
        let mut host = JobHost::new();
        host.register(busy.clone(), Duration::from_millis(10));

        let (sender, token) = shutdown_channel();
        let handle = tokio::spawn(host.run(token));
        tokio::time::sleep(Duration::from_millis(30)).await;
        sender.shutdown();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("host did not stop")
            .unwrap();
        assert!(busy.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_host_returns() {
        let (_sender, token) = shutdown_channel();
        let host = JobHost::new();
        assert!(host.is_empty());
        host.run(token).await;
    }
}
