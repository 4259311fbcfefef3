//! fleetbatch CLI - operator tool for ledgers and scheduled jobs

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tabled::{Table, Tabled};
use uuid::Uuid;

use fleetbatch_core::application::{RunOutcome, RunReport};
use fleetbatch_core::domain::{LedgerItem, ProcessingStatus};
use fleetbatch_core::port::{LedgerFilter, LedgerRepository};
use fleetbatch_daemon::{DaemonConfig, JobItem, Services};

#[derive(Parser)]
#[command(name = "fleetbatch-cli")]
#[command(about = "fleetbatch operator CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (same format as the daemon's)
    #[arg(short, long, env = "FLEETBATCH_CONFIG")]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a Pending item to a job's ledger
    Enqueue {
        /// Job name from the configuration
        #[arg(short, long)]
        job: String,

        /// Entity type (e.g., Opportunity, Volunteer)
        #[arg(short, long)]
        entity_type: String,

        /// Action to perform on the entity (e.g., Create, Update)
        #[arg(short, long)]
        action: String,

        /// Payload as JSON string
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// List ledger rows, optionally by status
    List {
        #[arg(short, long)]
        job: String,

        /// Pending, Processed, Error or Aborted
        #[arg(short, long)]
        status: Option<ProcessingStatus>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Show one ledger row as JSON
    Show {
        #[arg(short, long)]
        job: String,

        /// Ledger row ID
        id: Uuid,
    },

    /// Row counts per status for every configured job
    Status,

    /// Move Error rows under the retry cap back to Pending
    Requeue {
        #[arg(short, long)]
        job: String,
    },

    /// Move Error rows at the retry cap to Aborted
    AbortExhausted {
        #[arg(short, long)]
        job: String,
    },

    /// Run one processing cycle of a job now
    RunOnce {
        #[arg(short, long)]
        job: String,
    },
}

#[derive(Tabled)]
struct LedgerRow {
    id: String,
    entity_type: String,
    action: String,
    status: String,
    retries: u8,
    correlation_id: String,
    error: String,
    modified: String,
}

impl From<&JobItem> for LedgerRow {
    fn from(item: &JobItem) -> Self {
        let processing = item.processing();
        Self {
            id: item.id.to_string(),
            entity_type: item.entity_type.clone(),
            action: item.action.clone(),
            status: item.status().to_string(),
            retries: processing.retry_count,
            correlation_id: processing.external_correlation_id.clone().unwrap_or_default(),
            error: processing.error_reason.clone().unwrap_or_default(),
            modified: processing
                .date_modified
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Tabled)]
struct StatusRow {
    job: String,
    ledger: String,
    pending: i64,
    processed: i64,
    error: i64,
    aborted: i64,
}

#[derive(Tabled)]
struct ReportRow {
    job: String,
    outcome: String,
    batches: usize,
    processed: usize,
    failed: usize,
    write_failures: usize,
    requeued: usize,
    aborted: usize,
}

impl From<&RunReport> for ReportRow {
    fn from(report: &RunReport) -> Self {
        Self {
            job: report.job.clone(),
            outcome: report.outcome.to_string(),
            batches: report.batches,
            processed: report.processed,
            failed: report.failed,
            write_failures: report.write_failures,
            requeued: report.requeued,
            aborted: report.aborted,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Engine logs (lock acquired, per-item failures) go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fleetbatch=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DaemonConfig::load(cli.config.as_deref())?;
    let services = Services::connect(&config).await?;
    let result = execute(cli.command, &config, &services).await;
    services.close().await;
    result
}

async fn execute(command: Commands, config: &DaemonConfig, services: &Services) -> Result<()> {
    match command {
        Commands::Enqueue {
            job,
            entity_type,
            action,
            payload,
        } => {
            let job = config.job(&job)?;
            let payload: Value = serde_json::from_str(&payload).context("Invalid JSON payload")?;
            let ledger = services.ledger(job).await?;

            let item = JobItem::new(entity_type, action, payload, services.time_provider.now());
            let created = ledger.create(item).await?;

            println!("{}", "✓ Item enqueued".green().bold());
            println!();
            println!("{}", Table::new([LedgerRow::from(&created)]));
        }

        Commands::List { job, status, limit } => {
            let job = config.job(&job)?;
            let ledger = services.ledger(job).await?;

            let filter = match status {
                Some(status) => LedgerFilter::with_status(status),
                None => LedgerFilter::default(),
            }
            .limit(limit);
            let rows = ledger.query(&filter, None).await?;

            if rows.is_empty() {
                println!("{}", "No ledger rows".yellow());
            } else {
                println!("{}", Table::new(rows.iter().map(LedgerRow::from)));
            }
        }

        Commands::Show { job, id } => {
            let job = config.job(&job)?;
            let ledger = services.ledger(job).await?;

            match ledger.find_by_id(id).await? {
                Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                None => anyhow::bail!("Ledger row {} not found in '{}'", id, job.ledger),
            }
        }

        Commands::Status => {
            let mut rows = Vec::with_capacity(config.jobs.len());
            for job in &config.jobs {
                let ledger = services.ledger(job).await?;
                rows.push(StatusRow {
                    job: job.name.clone(),
                    ledger: job.ledger.clone(),
                    pending: ledger.count_by_status(ProcessingStatus::Pending).await?,
                    processed: ledger.count_by_status(ProcessingStatus::Processed).await?,
                    error: ledger.count_by_status(ProcessingStatus::Error).await?,
                    aborted: ledger.count_by_status(ProcessingStatus::Aborted).await?,
                });
            }
            println!("{}", "Ledger Status".cyan().bold());
            println!();
            println!("{}", Table::new(rows));
        }

        Commands::Requeue { job } => {
            let job = config.job(&job)?;
            let ledger = services.ledger(job).await?;
            let policy = services.retry_policy(job);
            let duration = services.maintenance_lock_duration(config, job);

            // Under the job's lock so a live run never sees rows change underneath it
            let requeued = services
                .locks
                .run_with_lock(job.options().lock_identifier(), duration, || async {
                    policy.requeue_failed::<JobItem>(ledger.as_ref()).await
                })
                .await?;

            println!("{}", format!("✓ {} row(s) requeued", requeued).green().bold());
        }

        Commands::AbortExhausted { job } => {
            let job = config.job(&job)?;
            if job.retry.max_retry_attempts.is_none() {
                println!(
                    "{}",
                    format!("Job '{}' has no retry cap; nothing is ever exhausted", job.name).yellow()
                );
                return Ok(());
            }
            let ledger = services.ledger(job).await?;
            let policy = services.retry_policy(job);
            let duration = services.maintenance_lock_duration(config, job);

            let aborted = services
                .locks
                .run_with_lock(job.options().lock_identifier(), duration, || async {
                    policy.abort_exhausted::<JobItem>(ledger.as_ref()).await
                })
                .await?;

            println!("{}", format!("✓ {} row(s) aborted", aborted).green().bold());
        }

        Commands::RunOnce { job } => {
            let job = config.job(&job)?;
            let processor = services.processor(config, job).await?;
            let report = processor.run().await;

            let headline = format!("Run finished: {}", report.outcome);
            match report.outcome {
                RunOutcome::Drained | RunOutcome::DeadlineReached => {
                    println!("{}", headline.green().bold())
                }
                RunOutcome::LockDenied | RunOutcome::ShutdownRequested => {
                    println!("{}", headline.yellow().bold())
                }
                RunOutcome::LockUnavailable | RunOutcome::Failed => {
                    println!("{}", headline.red().bold())
                }
            }
            println!();
            println!("{}", Table::new([ReportRow::from(&report)]));

            if let Some(error) = &report.error {
                anyhow::bail!("Run failed: {}", error);
            }
        }
    }

    Ok(())
}
