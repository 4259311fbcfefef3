//! fleetbatch daemon - runs the configured scheduled batch jobs

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use fleetbatch_core::application::{shutdown_channel, JobHost};
use fleetbatch_core::VERSION;
use fleetbatch_daemon::{telemetry, DaemonConfig, Services};

const LOG_FORMAT_ENV: &str = "FLEETBATCH_LOG_FORMAT";
const DEFAULT_LOG_FILTER: &str = "fleetbatch=info";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging (+ optional OpenTelemetry)
    init_logging();
    info!("fleetbatch v{} starting...", VERSION);

    // 2. Configuration
    let config_path = std::env::args().nth(1);
    let config = DaemonConfig::load(config_path.as_deref())?;
    info!(
        jobs = config.jobs.len(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    // 3. Database + lock service
    let services = Services::connect(&config).await?;
    info!(holder = services.locks.holder(), "Lock holder identity");

    // 4. One processor per configured job
    let mut host = JobHost::new();
    for job in &config.jobs {
        let processor = services.processor(&config, job).await?;
        info!(
            job = %job.name,
            ledger = %job.ledger,
            endpoint = %job.endpoint,
            every_secs = job.trigger_interval_in_seconds,
            "Job registered"
        );
        host.register(Arc::new(processor), job.trigger_interval());
    }

    // 5. Run until Ctrl+C
    let (shutdown_tx, shutdown_token) = shutdown_channel();
    let mut host_handle = tokio::spawn(host.run(shutdown_token));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    shutdown_tx.shutdown();

    // In-flight runs stop after their current item and still need the pool
    // to write it back and release their locks
    let joined = match tokio::time::timeout(SHUTDOWN_GRACE, &mut host_handle).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(
                "Job host still finishing in-flight items after {:?}, waiting for it",
                SHUTDOWN_GRACE
            );
            host_handle.await
        }
    };
    if let Err(e) = joined {
        error!(error = %e, "Job host ended abnormally");
    }

    services.close().await;
    info!("fleetbatch stopped");
    Ok(())
}

/// JSON output when `FLEETBATCH_LOG_FORMAT=json`, pretty otherwise
fn init_logging() {
    let log_format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (otel, otel_error) = match telemetry::otel_layer::<Registry>() {
        Ok(layer) => (layer, None),
        Err(e) => (None, Some(e)),
    };
    let otel_enabled = otel.is_some();

    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(otel)
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(otel)
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    if let Some(e) = otel_error {
        warn!(error = ?e, "Failed to initialize OpenTelemetry (continuing without it)");
    }
    telemetry::report_status(otel_enabled);
}
