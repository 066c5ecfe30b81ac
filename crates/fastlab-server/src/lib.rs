//! `fastlab-server` – The Fast Lab IO HTTP/WebSocket gateway
//!
//! Exposes the motor and camera over a small REST API plus two WebSocket
//! streams. Every request opens its own instrument session through a
//! [`ConnectionBroker`][fastlab_broker::ConnectionBroker] and releases it
//! before the response goes out; streams hold one session for their whole
//! life.
//!
//! Failures are returned as `{"kind", "detail"}` JSON with a status derived
//! from the error kind (see [`error::status_for`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fastlab_broker::ConnectionBroker;
//! use fastlab_hal::{CameraHandle, MotorHandle, SimCameraServer, SimMotorServer};
//! use fastlab_server::{AppState, router};
//! use fastlab_types::{InstrumentEndpoint, InstrumentKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let motor: ConnectionBroker<MotorHandle> = ConnectionBroker::new(
//!         InstrumentEndpoint::new(InstrumentKind::Motor, "localhost", 7200),
//!         Arc::new(SimMotorServer::new()),
//!     );
//!     let camera: ConnectionBroker<CameraHandle> = ConnectionBroker::new(
//!         InstrumentEndpoint::new(InstrumentKind::Camera, "localhost", 7100),
//!         Arc::new(SimCameraServer::default()),
//!     );
//!     let app = router(AppState::new(motor, camera));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod camera;
pub mod error;
pub mod motor;
pub mod server;
mod ws;

pub use error::{ApiError, ErrorBody};
pub use server::{AppState, DEFAULT_PORT, LabServer, MessageBody, ServerError, router};
