//! [`ConnectionBroker`] – bounded-time connect and guaranteed release.
//!
//! A broker owns the endpoint and connector for one instrument. Each
//! [`ConnectionBroker::acquire`] opens a fresh client and wraps it in a
//! [`Session`]; the session closes that client exactly once, either through
//! [`Session::release`] or, if the owner is cancelled first, from its `Drop`
//! impl.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use fastlab_broker::ConnectionBroker;
//! use fastlab_hal::{Motor, MotorHandle, SimMotorServer};
//! use fastlab_types::{InstrumentEndpoint, InstrumentKind, LabError};
//!
//! let server = SimMotorServer::new();
//! let broker: ConnectionBroker<MotorHandle> = ConnectionBroker::new(
//!     InstrumentEndpoint::new(InstrumentKind::Motor, "localhost", 7200),
//!     Arc::new(server.clone()),
//! );
//!
//! broker
//!     .with_session(|lease| async move {
//!         lease
//!             .call(|motor| motor.move_to(12.5))
//!             .await
//!             .map_err(|cause| LabError::operation_failed(InstrumentKind::Motor, "move motor", None, cause))
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(server.axis_position(), 12.5);
//! assert_eq!(server.closes(), 1);
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use fastlab_hal::{Connector, Instrument};
use fastlab_types::{InstrumentEndpoint, InstrumentFault, LabError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::offload::{Offloaded, offload};

const NO_CLIENT_DETAILS: &str =
    "server did not hand out a client; check that the instrument server is healthy";
const BUSY_DETAILS: &str = "instrument is busy serving another session";

// ────────────────────────────────────────────────────────────────────────────
// ConnectionBroker
// ────────────────────────────────────────────────────────────────────────────

/// Opens sessions against one instrument server.
///
/// Cloning is cheap; clones share the endpoint, connector and exclusivity
/// gate.
pub struct ConnectionBroker<H> {
    endpoint: Arc<InstrumentEndpoint>,
    connector: Arc<dyn Connector<H>>,
    gate: Option<Arc<Semaphore>>,
}

impl<H> Clone for ConnectionBroker<H> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            connector: Arc::clone(&self.connector),
            gate: self.gate.clone(),
        }
    }
}

impl<H: Instrument> ConnectionBroker<H> {
    pub fn new(endpoint: InstrumentEndpoint, connector: Arc<dyn Connector<H>>) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            connector,
            gate: None,
        }
    }

    /// Allow at most one live session at a time (builder-style).
    ///
    /// A caller that cannot get the instrument within the connect timeout
    /// fails with [`LabError::ConnectionUnavailable`] without attempting a
    /// connection.
    pub fn exclusive(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(1)));
        self
    }

    pub fn is_exclusive(&self) -> bool {
        self.gate.is_some()
    }

    pub fn endpoint(&self) -> &InstrumentEndpoint {
        &self.endpoint
    }

    /// Open a new client connection, bounded by the endpoint's connect
    /// timeout.
    ///
    /// The timeout covers the whole call, including any wait for an
    /// exclusive instrument. If this future is dropped while the connect is
    /// still running, the eventual client is closed in the background.
    ///
    /// # Errors
    ///
    /// - [`LabError::ConnectTimeout`] when the connect call outlives the
    ///   timeout. The call keeps running; if it eventually yields a client,
    ///   that client is closed in the background.
    /// - [`LabError::ConnectionUnavailable`] when the server hands out no
    ///   client, or an exclusive instrument stays busy for the whole timeout.
    /// - [`LabError::ConnectionError`] when the connect call fails.
    pub async fn acquire(&self) -> Result<Session<H>, LabError> {
        let ep = &self.endpoint;
        let deadline = Instant::now() + ep.connect_timeout;
        let permit = match &self.gate {
            Some(gate) => Some(self.wait_for_gate(gate, deadline).await?),
            None => None,
        };

        info!(instrument = %ep.kind, address = %ep.address(), "connecting to instrument server");
        let connector = Arc::clone(&self.connector);
        let (host, port) = (ep.host.clone(), ep.port);
        let mut pending = PendingConnect {
            task: Some(Offloaded::spawn(move || connector.connect(&host, port))),
            endpoint: Arc::clone(&self.endpoint),
        };

        match pending.join_until(deadline).await {
            Some(Ok(Some(handle))) => {
                let session = Session::new(handle, Arc::clone(&self.endpoint), permit);
                info!(
                    instrument = %ep.kind,
                    address = %ep.address(),
                    session = %session.id(),
                    "connected to instrument server"
                );
                Ok(session)
            }
            Some(Ok(None)) => {
                error!(instrument = %ep.kind, address = %ep.address(), "server handed out no client");
                Err(LabError::ConnectionUnavailable {
                    instrument: ep.kind,
                    host: ep.host.clone(),
                    port: ep.port,
                    details: NO_CLIENT_DETAILS.to_string(),
                })
            }
            Some(Err(cause)) => {
                error!(instrument = %ep.kind, address = %ep.address(), error = %cause, "connect failed");
                Err(LabError::ConnectionError {
                    instrument: ep.kind,
                    host: ep.host.clone(),
                    port: ep.port,
                    cause,
                })
            }
            None => {
                let timeout_ms = u64::try_from(ep.connect_timeout.as_millis()).unwrap_or(u64::MAX);
                error!(instrument = %ep.kind, address = %ep.address(), timeout_ms, "connect timed out");
                // `pending` still holds the call; dropping it reaps the client.
                Err(LabError::ConnectTimeout {
                    instrument: ep.kind,
                    host: ep.host.clone(),
                    port: ep.port,
                    timeout_ms,
                })
            }
        }
    }

    /// Acquire a session, run `body` with a [`Lease`] on it, then release.
    ///
    /// The release runs whether `body` succeeds or fails. If the returned
    /// future is dropped midway, the session's `Drop` impl releases instead.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error, or whatever `body` returns.
    pub async fn with_session<T, F, Fut>(&self, body: F) -> Result<T, LabError>
    where
        F: FnOnce(Lease<H>) -> Fut,
        Fut: Future<Output = Result<T, LabError>>,
    {
        let session = self.acquire().await?;
        let outcome = body(session.lease()).await;
        session.release().await;
        outcome
    }

    async fn wait_for_gate(&self, gate: &Arc<Semaphore>, deadline: Instant) -> Result<OwnedSemaphorePermit, LabError> {
        let ep = &self.endpoint;
        match tokio::time::timeout_at(deadline, Arc::clone(gate).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => {
                warn!(instrument = %ep.kind, address = %ep.address(), "instrument busy");
                Err(LabError::ConnectionUnavailable {
                    instrument: ep.kind,
                    host: ep.host.clone(),
                    port: ep.port,
                    details: BUSY_DETAILS.to_string(),
                })
            }
        }
    }
}

/// An in-flight connect owned by [`ConnectionBroker::acquire`].
///
/// If the call has not been joined when this is dropped (timeout, or the
/// caller was cancelled), its eventual client is closed in the background.
struct PendingConnect<H: Instrument> {
    task: Option<Offloaded<Option<H>>>,
    endpoint: Arc<InstrumentEndpoint>,
}

impl<H: Instrument> PendingConnect<H> {
    async fn join_until(&mut self, deadline: Instant) -> Option<Result<Option<H>, InstrumentFault>> {
        let outcome = self.task.as_mut()?.join_until(deadline).await;
        if outcome.is_some() {
            self.task = None;
        }
        outcome
    }
}

impl<H: Instrument> Drop for PendingConnect<H> {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        // Without a runtime the blocking task is gone with it.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(reap_orphan(task, Arc::clone(&self.endpoint)));
        }
    }
}

/// Close a client whose connect call finished after its caller gave up.
async fn reap_orphan<H: Instrument>(pending: Offloaded<Option<H>>, endpoint: Arc<InstrumentEndpoint>) {
    let Ok(Some(mut handle)) = pending.join().await else {
        return;
    };
    warn!(
        instrument = %endpoint.kind,
        address = %endpoint.address(),
        "connect completed after its caller gave up; closing orphaned client"
    );
    if let Err(err) = offload(move || handle.close().transpose()).await {
        warn!(instrument = %endpoint.kind, error = %err, "failed to close orphaned client");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lease
// ────────────────────────────────────────────────────────────────────────────

/// Shared access to a session's client for issuing calls.
///
/// A lease does not keep the connection open: once its session is released,
/// calls reach a closed client and fail with that client's error.
pub struct Lease<H> {
    handle: Arc<Mutex<H>>,
    endpoint: Arc<InstrumentEndpoint>,
}

impl<H> Clone for Lease<H> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

impl<H: Instrument> Lease<H> {
    /// Run one blocking call against the client on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the client's fault, or a fault describing a panic in `op`.
    pub async fn call<T, F>(&self, op: F) -> Result<T, InstrumentFault>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, InstrumentFault> + Send + 'static,
    {
        let handle = Arc::clone(&self.handle);
        offload(move || {
            let mut client = handle.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut client)
        })
        .await
    }

    pub fn endpoint(&self) -> &InstrumentEndpoint {
        &self.endpoint
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

/// Exclusive ownership of one live client connection.
pub struct Session<H: Instrument> {
    id: Uuid,
    lease: Lease<H>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl<H: Instrument> Session<H> {
    fn new(handle: H, endpoint: Arc<InstrumentEndpoint>, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lease: Lease {
                handle: Arc::new(Mutex::new(handle)),
                endpoint,
            },
            permit,
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &InstrumentEndpoint {
        &self.lease.endpoint
    }

    pub fn lease(&self) -> Lease<H> {
        self.lease.clone()
    }

    /// See [`Lease::call`].
    ///
    /// # Errors
    ///
    /// Returns the client's fault.
    pub async fn call<T, F>(&self, op: F) -> Result<T, InstrumentFault>
    where
        T: Send + 'static,
        F: FnOnce(&mut H) -> Result<T, InstrumentFault> + Send + 'static,
    {
        self.lease.call(op).await
    }

    /// Close the client and wait for the close to finish.
    ///
    /// Close failures are logged and otherwise ignored. The exclusivity
    /// permit, if any, is given back only after the close completes.
    pub async fn release(mut self) {
        self.released = true;
        let handle = Arc::clone(&self.lease.handle);
        let outcome = offload(move || close_client(&handle)).await;
        log_release(&self.lease.endpoint, self.id, outcome);
    }
}

impl<H: Instrument> Drop for Session<H> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(session = %self.id, "session dropped without release; closing in background");

        let handle = Arc::clone(&self.lease.handle);
        let endpoint = Arc::clone(&self.lease.endpoint);
        let id = self.id;
        let permit = self.permit.take();
        let close = move || {
            log_release(&endpoint, id, close_client(&handle));
            drop(permit);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

fn close_client<H: Instrument>(handle: &Mutex<H>) -> Result<Option<()>, InstrumentFault> {
    handle
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close()
        .transpose()
}

fn log_release(endpoint: &InstrumentEndpoint, id: Uuid, outcome: Result<Option<()>, InstrumentFault>) {
    match outcome {
        Ok(Some(())) => info!(instrument = %endpoint.kind, session = %id, "connection released"),
        Ok(None) => debug!(instrument = %endpoint.kind, session = %id, "client has no release capability"),
        Err(err) => warn!(
            instrument = %endpoint.kind,
            session = %id,
            error = %err,
            "error while releasing connection; ignoring"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastlab_hal::{Motor, MotorHandle, SimMotorServer};
    use fastlab_types::{ErrorKind, InstrumentKind};
    use std::time::Duration;

    fn broker_for(server: &SimMotorServer, timeout: Duration) -> ConnectionBroker<MotorHandle> {
        ConnectionBroker::new(
            InstrumentEndpoint::new(InstrumentKind::Motor, "localhost", 7200).with_connect_timeout(timeout),
            Arc::new(server.clone()),
        )
    }

    fn move_failed(cause: InstrumentFault) -> LabError {
        LabError::operation_failed(InstrumentKind::Motor, "move motor", Some("1.0".into()), cause)
    }

    /// Poll until the background release path has caught up.
    async fn wait_for_closes(server: &SimMotorServer, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.closes() < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.closes(), expected);
    }

    #[tokio::test]
    async fn session_runs_calls_and_releases_once() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(5));

        let position = broker
            .with_session(|lease| async move {
                lease.call(|m| m.move_to(12.5)).await.map_err(move_failed)?;
                lease.call(|m| m.position()).await.map_err(move_failed)
            })
            .await
            .unwrap();

        assert_eq!(position, 12.5);
        assert_eq!(server.connects(), 1);
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn every_acquire_is_matched_by_a_release() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(5));

        for _ in 0..5 {
            let session = broker.acquire().await.unwrap();
            session.release().await;
        }
        assert_eq!(server.connects(), 5);
        assert_eq!(server.closes(), 5);
    }

    #[tokio::test]
    async fn slow_connect_times_out_without_release() {
        let server = SimMotorServer::new().with_connect_delay(Duration::from_millis(600));
        let broker = broker_for(&server, Duration::from_millis(50));

        let started = Instant::now();
        let err = broker.acquire().await.err().unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
        assert!(err.to_string().contains("after 50 ms"), "{err}");
        assert_eq!(server.closes(), 0);
    }

    #[tokio::test]
    async fn late_client_is_closed_in_background() {
        let server = SimMotorServer::new().with_connect_delay(Duration::from_millis(100));
        let broker = broker_for(&server, Duration::from_millis(10));

        let err = broker.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
        wait_for_closes(&server, 1).await;
    }

    #[tokio::test]
    async fn missing_client_is_connection_unavailable() {
        let server = SimMotorServer::new().refusing();
        let broker = broker_for(&server, Duration::from_secs(5));

        let err = broker.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionUnavailable);
        assert_eq!(server.closes(), 0);
    }

    #[tokio::test]
    async fn connect_fault_is_connection_error_with_cause() {
        let server = SimMotorServer::new().failing_connect("connection refused");
        let broker = broker_for(&server, Duration::from_secs(5));

        let err = broker.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
        assert!(err.to_string().contains("connection refused"), "{err}");
    }

    #[tokio::test]
    async fn failed_operation_still_releases_once() {
        let server = SimMotorServer::new().failing_calls("axis fault");
        let broker = broker_for(&server, Duration::from_secs(5));

        let err = broker
            .with_session(|lease| async move { lease.call(|m| m.move_to(1.0)).await.map_err(move_failed) })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert_eq!(err.to_string(), "Could not move motor (input: 1.0): axis fault");
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn release_failure_is_suppressed() {
        let server = SimMotorServer::new().failing_close("socket already gone");
        let broker = broker_for(&server, Duration::from_secs(5));

        let result = broker
            .with_session(|lease| async move { lease.call(|m| m.move_to(3.0)).await.map_err(move_failed) })
            .await;

        assert!(result.is_ok());
        assert_eq!(server.axis_position(), 3.0);
    }

    #[tokio::test]
    async fn client_without_close_is_fine() {
        let server = SimMotorServer::new().without_close();
        let broker = broker_for(&server, Duration::from_secs(5));

        broker.acquire().await.unwrap().release().await;
        assert_eq!(server.closes(), 0);
    }

    #[tokio::test]
    async fn dropped_session_is_released() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(5));

        let session = broker.acquire().await.unwrap();
        drop(session);
        wait_for_closes(&server, 1).await;
    }

    #[tokio::test]
    async fn cancelled_request_releases_its_session() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(5));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            broker.with_session(|_lease| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        )
        .await;

        assert!(abandoned.is_err());
        wait_for_closes(&server, 1).await;
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn cancelled_connect_closes_the_late_client() {
        let server = SimMotorServer::new().with_connect_delay(Duration::from_millis(100));
        let broker = broker_for(&server, Duration::from_secs(5));

        let abandoned = tokio::time::timeout(Duration::from_millis(20), broker.acquire()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.connects(), 1);
        wait_for_closes(&server, 1).await;
    }

    #[tokio::test]
    async fn concurrent_sessions_are_independent() {
        let server = SimMotorServer::new().with_call_latency(Duration::from_millis(20));
        let broker = broker_for(&server, Duration::from_secs(5));

        let ok = broker.with_session(|lease| async move { lease.call(|m| m.move_to(4.0)).await.map_err(move_failed) });
        let failing = broker.with_session(|lease| async move {
            lease
                .call(|_m| Err::<(), _>(InstrumentFault::new("unit not homed")))
                .await
                .map_err(move_failed)
        });
        let (ok, failing) = tokio::join!(ok, failing);

        assert!(ok.is_ok());
        assert!(failing.unwrap_err().to_string().contains("unit not homed"));
        assert_eq!(server.connects(), 2);
        assert_eq!(server.closes(), 2);
    }

    #[tokio::test]
    async fn panicking_call_is_a_fault_and_session_still_releases() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(5));

        let session = broker.acquire().await.unwrap();
        let err = session
            .call(|_m| -> Result<(), InstrumentFault> { panic!("driver bug") })
            .await
            .unwrap_err();
        assert!(err.message().contains("driver bug"));

        session.release().await;
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn exclusive_broker_admits_one_session_at_a_time() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_millis(50)).exclusive();
        assert!(broker.is_exclusive());

        let first = broker.acquire().await.unwrap();
        let err = broker.acquire().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConnectionUnavailable);
        assert!(err.to_string().contains("busy"), "{err}");
        assert_eq!(server.connects(), 1);

        first.release().await;
        let second = broker.acquire().await.unwrap();
        second.release().await;
        assert_eq!(server.connects(), 2);
        assert_eq!(server.closes(), 2);
    }

    #[tokio::test]
    async fn exclusive_waiter_gets_the_instrument_once_freed() {
        let server = SimMotorServer::new();
        let broker = broker_for(&server, Duration::from_secs(2)).exclusive();

        let first = broker.acquire().await.unwrap();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.acquire().await.map(|s| s.id()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let first_id = first.id();
        first.release().await;

        let second_id = waiter.await.unwrap().unwrap();
        assert_ne!(first_id, second_id);
        wait_for_closes(&server, 2).await;
    }

    #[tokio::test]
    async fn gate_wait_and_connect_share_one_timeout() {
        let server = SimMotorServer::new().with_connect_delay(Duration::from_millis(200));
        let broker = broker_for(&server, Duration::from_millis(300)).exclusive();

        let first = broker.acquire().await.unwrap();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = broker.acquire().await;
                (outcome.err(), started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        first.release().await;

        let (err, elapsed) = waiter.await.unwrap();
        assert_eq!(err.unwrap().kind(), ErrorKind::ConnectTimeout);
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
        // The late second client is reaped once its connect finishes.
        wait_for_closes(&server, 2).await;
    }
}
