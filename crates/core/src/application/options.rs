// Schedule and per-job options

use crate::application::processor::constants::*;
use crate::error::{AppError, Result};
use serde::Deserialize;
use std::time::Duration;

const SECS_PER_HOUR: u64 = 3600;
const SECS_PER_MINUTE: u64 = 60;

/// Fleet-wide schedule options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    /// Wall-clock budget of one run when the job does not override it
    pub default_schedule_max_interval_in_hours: u32,
    /// Safety margin added to the lock TTL over the run budget
    pub distributed_lock_duration_buffer_in_minutes: u32,
    /// Poll delay of `run_with_lock` while the lock is held elsewhere
    pub distributed_lock_retry_delay_in_milliseconds: u64,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            default_schedule_max_interval_in_hours: DEFAULT_SCHEDULE_MAX_INTERVAL_HOURS,
            distributed_lock_duration_buffer_in_minutes: DEFAULT_LOCK_DURATION_BUFFER_MINUTES,
            distributed_lock_retry_delay_in_milliseconds: DEFAULT_LOCK_RETRY_DELAY_MS,
        }
    }
}

impl ScheduleOptions {
    pub fn validate(&self) -> Result<()> {
        if self.default_schedule_max_interval_in_hours == 0 {
            return Err(AppError::Config(
                "default_schedule_max_interval_in_hours must be greater than zero".to_string(),
            ));
        }
        if self.distributed_lock_duration_buffer_in_minutes == 0 {
            return Err(AppError::Config(
                "distributed_lock_duration_buffer_in_minutes must be greater than zero".to_string(),
            ));
        }
        if self.distributed_lock_retry_delay_in_milliseconds == 0 {
            return Err(AppError::Config(
                "distributed_lock_retry_delay_in_milliseconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_duration_buffer(&self) -> Duration {
        Duration::from_secs(u64::from(self.distributed_lock_duration_buffer_in_minutes) * SECS_PER_MINUTE)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.distributed_lock_retry_delay_in_milliseconds)
    }
}

/// Retry cap for failed ledger rows.
///
/// `max_retry_attempts` counts retries after the first attempt: with a cap of
/// 2 a row may fail three times before it is aborted. No cap means failed rows
/// are requeued forever (only when a sweep runs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_retry_attempts: Option<u8>,
    /// Sweep Error rows (requeue / abort) at the start of every run
    pub requeue_on_run: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Options for one scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobOptions {
    pub name: String,
    /// Distributed lock name; defaults to the job name
    #[serde(default)]
    pub lock_identifier: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Overrides `default_schedule_max_interval_in_hours`
    #[serde(default)]
    pub max_interval_in_hours: Option<u32>,
    #[serde(default)]
    pub retry: RetryOptions,
}

impl JobOptions {
    pub fn new(name: impl Into<String>, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            lock_identifier: None,
            batch_size,
            max_interval_in_hours: None,
            retry: RetryOptions::default(),
        }
    }

    pub fn with_lock_identifier(mut self, lock_identifier: impl Into<String>) -> Self {
        self.lock_identifier = Some(lock_identifier.into());
        self
    }

    pub fn with_max_interval_in_hours(mut self, hours: u32) -> Self {
        self.max_interval_in_hours = Some(hours);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn lock_identifier(&self) -> &str {
        self.lock_identifier
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.name.trim())
    }

    /// Wall-clock budget of one run
    pub fn max_interval(&self, schedule: &ScheduleOptions) -> Duration {
        let hours = self
            .max_interval_in_hours
            .unwrap_or(schedule.default_schedule_max_interval_in_hours);
        Duration::from_secs(u64::from(hours) * SECS_PER_HOUR)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("Job name must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config(format!(
                "Job '{}': batch_size must be greater than zero",
                self.name
            )));
        }
        if self.max_interval_in_hours == Some(0) {
            return Err(AppError::Config(format!(
                "Job '{}': max_interval_in_hours must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let schedule = ScheduleOptions::default();
        assert_eq!(schedule.default_schedule_max_interval_in_hours, 2);
        assert_eq!(schedule.lock_duration_buffer(), Duration::from_secs(300));
        assert_eq!(schedule.lock_retry_delay(), Duration::from_millis(500));
        assert!(schedule.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        let schedule = ScheduleOptions {
            distributed_lock_duration_buffer_in_minutes: 0,
            ..ScheduleOptions::default()
        };
        assert!(matches!(schedule.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_job_interval_override_and_lock_identifier() {
        let schedule = ScheduleOptions::default();
        let job = JobOptions::new("partner-sharing", 100);
        assert_eq!(job.lock_identifier(), "partner-sharing");
        assert_eq!(job.max_interval(&schedule), Duration::from_secs(2 * 3600));

        let job = job
            .with_lock_identifier("  ")
            .with_max_interval_in_hours(6);
        assert_eq!(job.lock_identifier(), "partner-sharing");
        assert_eq!(job.max_interval(&schedule), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_job_validation() {
        assert!(JobOptions::new("wallets", 0).validate().is_err());
        assert!(JobOptions::new(" ", 10).validate().is_err());
        assert!(JobOptions::new("wallets", 10)
            .with_max_interval_in_hours(0)
            .validate()
            .is_err());
        assert!(JobOptions::new("wallets", 10).validate().is_ok());
    }

    #[test]
    fn test_job_deserializes_with_defaults() {
        let job: JobOptions = serde_json::from_str(r#"{"name": "downloads"}"#).unwrap();
        assert_eq!(job.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(job.retry, RetryOptions::default());
        assert_eq!(job.lock_identifier, None);
    }
}
