// fleetbatch Infrastructure - HTTP Adapter
// Implements: BatchAction (partner dispatch over HTTP)

mod dispatch;
mod types;

pub use dispatch::{interpret_response, HttpDispatchAction, IDEMPOTENCY_HEADER};
pub use types::{DispatchRequest, DispatchResponse};
