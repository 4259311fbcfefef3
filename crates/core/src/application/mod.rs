// Application Layer - Use Cases and Business Logic

pub mod host;
pub mod lock_service;
pub mod options;
pub mod processor;
pub mod retry;

// Re-exports
pub use host::{JobHost, ScheduledJob};
pub use lock_service::DistributedLockService;
pub use options::{JobOptions, RetryOptions, ScheduleOptions};
pub use processor::{
    shutdown_channel, RunOutcome, RunReport, ScheduledProcessor, ShutdownSender, ShutdownToken,
};
pub use retry::RetryPolicy;
