//! Blocking-call adapter.
//!
//! Every instrument call goes through [`offload`] so that a slow server can
//! only ever hold a blocking-pool thread, never an executor worker.

use std::any::Any;

use fastlab_types::InstrumentFault;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// A blocking instrument call running on the blocking pool.
///
/// Dropping an `Offloaded` detaches it: the call still runs to completion.
#[must_use = "the call keeps running but its outcome is lost unless joined"]
#[derive(Debug)]
pub struct Offloaded<T> {
    task: JoinHandle<Result<T, InstrumentFault>>,
}

impl<T: Send + 'static> Offloaded<T> {
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, InstrumentFault> + Send + 'static,
    {
        Self {
            task: tokio::task::spawn_blocking(work),
        }
    }

    /// Wait for the call to finish.
    ///
    /// A panic inside the call is reported as a fault carrying the panic
    /// message.
    pub async fn join(self) -> Result<T, InstrumentFault> {
        self.task
            .await
            .unwrap_or_else(|err| Err(fault_from_join_error(err)))
    }

    /// Wait for the call to finish, but not past `deadline`.
    ///
    /// Returns `None` on expiry; the call keeps running and can be waited on
    /// again. Once this returns `Some`, the outcome has been taken and the
    /// `Offloaded` must not be joined again.
    pub async fn join_until(&mut self, deadline: Instant) -> Option<Result<T, InstrumentFault>> {
        let joined = tokio::time::timeout_at(deadline, &mut self.task).await.ok()?;
        Some(joined.unwrap_or_else(|err| Err(fault_from_join_error(err))))
    }
}

/// Run a blocking `work` closure on the blocking pool and await its result.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use fastlab_broker::offload;
///
/// let answer = offload(|| Ok(6 * 7)).await.unwrap();
/// assert_eq!(answer, 42);
/// # }
/// ```
pub async fn offload<T, F>(work: F) -> Result<T, InstrumentFault>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InstrumentFault> + Send + 'static,
{
    Offloaded::spawn(work).join().await
}

fn fault_from_join_error(err: JoinError) -> InstrumentFault {
    if err.is_panic() {
        let payload = err.into_panic();
        InstrumentFault::new(format!(
            "instrument call panicked: {}",
            panic_message(&*payload)
        ))
    } else {
        InstrumentFault::new(format!("instrument call was cancelled: {err}"))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
