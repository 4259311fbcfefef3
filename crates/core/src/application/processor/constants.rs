// Engine constants (no magic values)

/// Key namespace for distributed locks
pub const LOCK_KEY_PREFIX: &str = "fleetbatch:locks";

/// DefaultScheduleMaxIntervalInHours when not configured
pub const DEFAULT_SCHEDULE_MAX_INTERVAL_HOURS: u32 = 2;

/// DistributedLockDurationBufferInMinutes when not configured
pub const DEFAULT_LOCK_DURATION_BUFFER_MINUTES: u32 = 5;

/// DistributedLockRetryDelayInMilliseconds when not configured
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 500;

/// Claim chunk size when a job does not set one
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Holder name used when the host name cannot be determined
pub const UNKNOWN_HOST: &str = "unknown-host";
