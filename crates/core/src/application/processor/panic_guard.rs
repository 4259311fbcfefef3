// Panic isolation for business actions and run bodies
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed (possibly with its own error)
    Success(T),
    /// Execution panicked; carries the panic message
    Panicked(String),
}

/// Await `future`, turning a panic into [`PanicGuardResult::Panicked`].
///
/// A panicking business action must only fail its own item, never the run or
/// the daemon. Requires the workspace to build with `panic = "unwind"`.
pub async fn execute_guarded<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            error!(panic_msg = %panic_msg, "Guarded task panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
