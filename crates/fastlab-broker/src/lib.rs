//! `fastlab-broker` – Connection lifecycle for blocking instrument clients
//!
//! Instrument client libraries are synchronous and may stall for arbitrarily
//! long. This crate keeps them off the async executor and guarantees that
//! every client it hands out is released exactly once.
//!
//! # Modules
//!
//! - [`offload`] – [`offload`][offload::offload] and
//!   [`Offloaded`][offload::Offloaded]: run a blocking call on tokio's
//!   blocking pool and await it without stalling other tasks.
//! - [`broker`] – [`ConnectionBroker`][broker::ConnectionBroker]:
//!   bounded-time connect, typed connect errors, and the
//!   [`Session`][broker::Session] guard that owns one live client.
//! - [`stream`] – [`stream_session`][stream::stream_session]:
//!   the fetch/forward loop behind the WebSocket streams.

pub mod broker;
pub mod offload;
pub mod stream;

pub use broker::{ConnectionBroker, Lease, Session};
pub use offload::{Offloaded, offload};
pub use stream::{SampleSink, SinkClosed, StreamEnd, StreamPacing, pump, stream_session};
