// Daemon configuration (TOML file + FLEETBATCH__* environment overrides)

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use fleetbatch_core::application::processor::constants::DEFAULT_BATCH_SIZE;
use fleetbatch_core::application::{JobOptions, RetryOptions, ScheduleOptions};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "FLEETBATCH_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "fleetbatch";
const ENV_PREFIX: &str = "FLEETBATCH";
const ENV_SEPARATOR: &str = "__";

fn default_max_connections() -> u32 {
    10
}

fn default_trigger_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub schedule: ScheduleOptions,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// One scheduled job: its processing options plus where items live and go
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub lock_identifier: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_interval_in_hours: Option<u32>,
    #[serde(default)]
    pub retry: RetryOptions,

    /// Ledger table holding this job's items
    pub ledger: String,
    /// Partner endpoint each item is POSTed to
    pub endpoint: String,
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_in_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_in_seconds: u64,
}

impl JobConfig {
    pub fn options(&self) -> JobOptions {
        let mut options = JobOptions::new(
            self.name.clone(),
            self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        )
        .with_retry(self.retry.clone());
        if let Some(lock_identifier) = &self.lock_identifier {
            options = options.with_lock_identifier(lock_identifier.clone());
        }
        if let Some(hours) = self.max_interval_in_hours {
            options = options.with_max_interval_in_hours(hours);
        }
        options
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_interval_in_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }
}

impl DaemonConfig {
    /// Load from `path`, else `$FLEETBATCH_CONFIG`, else `./fleetbatch.toml`
    /// when present; `FLEETBATCH__*` environment variables override the file
    pub fn load(path: Option<&str>) -> Result<Self> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok());
        let file = match explicit {
            Some(path) => File::with_name(&path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::build(Config::builder().add_source(file))
    }

    /// Parse a TOML document, environment overrides included
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: DaemonConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig> {
        self.jobs
            .iter()
            .find(|job| job.name.trim() == name.trim())
            .with_context(|| format!("No job named '{}' in configuration", name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("database_url must be set");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be greater than zero");
        }
        self.schedule.validate()?;

        // Jobs never share a lock name or a ledger table
        let mut names = HashSet::new();
        let mut lock_identifiers = HashSet::new();
        let mut ledgers = HashSet::new();
        for job in &self.jobs {
            let options = job.options();
            options.validate()?;
            if !names.insert(job.name.trim()) {
                bail!("Job '{}' is configured more than once", job.name);
            }
            if !lock_identifiers.insert(options.lock_identifier().to_string()) {
                bail!(
                    "Job '{}' uses lock identifier '{}' already taken by another job",
                    job.name,
                    options.lock_identifier()
                );
            }
            if job.ledger.trim().is_empty() {
                bail!("Job '{}' has no ledger table", job.name);
            }
            if !ledgers.insert(job.ledger.trim()) {
                bail!(
                    "Job '{}' uses ledger table '{}' already taken by another job",
                    job.name,
                    job.ledger.trim()
                );
            }
            if job.endpoint.trim().is_empty() {
                bail!("Job '{}' has no endpoint", job.name);
            }
            if job.trigger_interval_in_seconds == 0 {
                bail!("Job '{}': trigger_interval_in_seconds must be greater than zero", job.name);
            }
            if job.request_timeout_in_seconds == 0 {
                bail!("Job '{}': request_timeout_in_seconds must be greater than zero", job.name);
            }
        }
        Ok(())
    }
}
