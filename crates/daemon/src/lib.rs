//! fleetbatch daemon library: configuration, telemetry and adapter wiring
//! shared by the `fleetbatch` daemon and the operator CLI

pub mod settings;
pub mod telemetry;
pub mod wiring;

pub use settings::{DaemonConfig, JobConfig};
pub use wiring::{JobItem, Services};
