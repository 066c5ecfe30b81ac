//! Streaming loop: fetch samples from a session and forward them to a client.
//!
//! The loop itself knows nothing about WebSockets. The transport supplies a
//! [`SampleSink`] and a future that resolves when the peer goes away;
//! [`stream_session`] owns the session for the life of the stream and
//! releases it on every exit path.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use fastlab_hal::Instrument;
use fastlab_types::{InstrumentFault, LabError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument as _;
use tracing::{debug, error, info, info_span};

use crate::broker::Session;

/// The client can no longer receive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Destination of a sample stream.
#[async_trait]
pub trait SampleSink<S: Send + 'static>: Send {
    /// # Errors
    ///
    /// Returns [`SinkClosed`] once the client is gone.
    async fn send(&mut self, sample: S) -> Result<(), SinkClosed>;
}

/// How fast the loop polls the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPacing {
    /// Minimum spacing between fetch starts. `None` lets the instrument's own
    /// call latency set the rate.
    pub min_interval: Option<Duration>,
    /// Pause after a fetch that produced nothing.
    pub idle_backoff: Duration,
}

impl Default for StreamPacing {
    fn default() -> Self {
        Self {
            min_interval: None,
            idle_backoff: Duration::from_millis(10),
        }
    }
}

impl StreamPacing {
    /// Fetch at most once per `interval`.
    pub fn every(interval: Duration) -> Self {
        Self {
            min_interval: Some(interval),
            ..Self::default()
        }
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    ClientDisconnected,
    /// An instrument call failed; the transport should tell the client.
    Failed(LabError),
}

/// Fetch and forward samples until the sink closes or a fetch fails.
///
/// `fetch` returning `Ok(None)` means "nothing this time": the sample is
/// skipped and the loop retries after `pacing.idle_backoff`. The session is
/// borrowed, not released; see [`stream_session`].
pub async fn pump<H, S, K, F>(
    session: &Session<H>,
    sink: &mut K,
    pacing: StreamPacing,
    operation: &str,
    fetch: F,
) -> StreamEnd
where
    H: Instrument,
    S: Send + 'static,
    K: SampleSink<S> + ?Sized,
    F: Fn(&mut H) -> Result<Option<S>, InstrumentFault> + Clone + Send + 'static,
{
    let mut sent: u64 = 0;
    let mut last_fetch: Option<Instant> = None;

    loop {
        if let (Some(interval), Some(last)) = (pacing.min_interval, last_fetch) {
            tokio::time::sleep_until(last + interval).await;
        }
        last_fetch = Some(Instant::now());

        let fetch = fetch.clone();
        match session.call(move |client| fetch(client)).await {
            Ok(Some(sample)) => {
                if sink.send(sample).await.is_err() {
                    info!(samples = sent, "client disconnected");
                    return StreamEnd::ClientDisconnected;
                }
                sent += 1;
            }
            Ok(None) => {
                debug!("no sample available; skipping");
                tokio::time::sleep(pacing.idle_backoff).await;
            }
            Err(cause) => {
                let err = LabError::operation_failed(session.endpoint().kind, operation, None, cause);
                error!(samples = sent, error = %err, "stream failed");
                return StreamEnd::Failed(err);
            }
        }
    }
}

/// Run [`pump`] until it ends or `disconnected` resolves, then release the
/// session.
///
/// Exactly one release happens per call, regardless of why the stream
/// stopped. If this future is itself dropped, the session's `Drop` impl
/// takes over.
pub async fn stream_session<H, S, K, F, D>(
    session: Session<H>,
    sink: &mut K,
    disconnected: D,
    pacing: StreamPacing,
    operation: &str,
    fetch: F,
) -> StreamEnd
where
    H: Instrument,
    S: Send + 'static,
    K: SampleSink<S> + ?Sized,
    F: Fn(&mut H) -> Result<Option<S>, InstrumentFault> + Clone + Send + 'static,
    D: Future<Output = ()>,
{
    let span = info_span!(
        "stream",
        instrument = %session.endpoint().kind,
        session = %session.id(),
        operation
    );

    async move {
        info!("stream started");
        let end = tokio::select! {
            end = pump(&session, sink, pacing, operation, fetch) => end,
            () = disconnected => {
                info!("client went away");
                StreamEnd::ClientDisconnected
            }
        };
        session.release().await;
        end
    }
    .instrument(span)
    .await
}
