//! [`LabServer`] – HTTP + WebSocket front end for the instrument brokers.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`LabServer::with_host`] and
//! [`LabServer::with_port`]).
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /` | welcome message |
//! | `PUT /motor/move`, `GET /motor/position`, `PUT /motor/speed` | [`crate::motor`] |
//! | `GET /motor/ws/status` | motor position stream |
//! | `GET /camera/frame`, `PUT /camera/exposure`, `PUT /camera/gain` | [`crate::camera`] |
//! | `GET /camera/ws/camera/stream` | camera JPEG stream |

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::routing::{get, put};
use axum::{Json, Router};
use fastlab_broker::{ConnectionBroker, StreamPacing};
use fastlab_hal::{CameraHandle, MotorHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::camera::{self, DEFAULT_JPEG_QUALITY};
use crate::motor;

/// Default TCP port for the HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8000;

pub const WELCOME: &str = "Welcome to the Fast Lab IO API";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("server stopped: {0}")]
    Serve(#[from] io::Error),
}

/// `{"message": "..."}` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

/// Everything a handler needs, cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub motor: ConnectionBroker<MotorHandle>,
    pub camera: ConnectionBroker<CameraHandle>,
    pub motor_pacing: StreamPacing,
    pub camera_pacing: StreamPacing,
    pub jpeg_quality: u8,
}

impl AppState {
    /// State with self-paced streams and the default JPEG quality.
    pub fn new(motor: ConnectionBroker<MotorHandle>, camera: ConnectionBroker<CameraHandle>) -> Self {
        Self {
            motor,
            camera,
            motor_pacing: StreamPacing::default(),
            camera_pacing: StreamPacing::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_motor_pacing(mut self, pacing: StreamPacing) -> Self {
        self.motor_pacing = pacing;
        self
    }

    pub fn with_camera_pacing(mut self, pacing: StreamPacing) -> Self {
        self.camera_pacing = pacing;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/motor/move", put(motor::move_motor))
        .route("/motor/position", get(motor::get_position))
        .route("/motor/speed", put(motor::set_speed))
        .route("/motor/ws/status", get(motor::status_stream))
        .route("/camera/frame", get(camera::get_frame))
        .route("/camera/exposure", put(camera::set_exposure))
        .route("/camera/gain", put(camera::set_gain))
        .route("/camera/ws/camera/stream", get(camera::frame_stream))
        .with_state(state)
}

async fn welcome() -> Json<MessageBody> {
    info!("root endpoint accessed");
    Json(MessageBody::new(WELCOME))
}

// ────────────────────────────────────────────────────────────────────────────
// LabServer
// ────────────────────────────────────────────────────────────────────────────

/// The gateway's HTTP server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fastlab_broker::ConnectionBroker;
/// use fastlab_hal::{CameraHandle, MotorHandle, SimCameraServer, SimMotorServer};
/// use fastlab_server::{AppState, LabServer};
/// use fastlab_types::{InstrumentEndpoint, InstrumentKind};
///
/// #[tokio::main]
/// async fn main() {
///     let motor: ConnectionBroker<MotorHandle> = ConnectionBroker::new(
///         InstrumentEndpoint::new(InstrumentKind::Motor, "localhost", 7200),
///         Arc::new(SimMotorServer::new()),
///     );
///     let camera: ConnectionBroker<CameraHandle> = ConnectionBroker::new(
///         InstrumentEndpoint::new(InstrumentKind::Camera, "localhost", 7100),
///         Arc::new(SimCameraServer::default()),
///     );
///     LabServer::new(AppState::new(motor, camera))
///         .with_port(8000)
///         .run()
///         .await
///         .expect("server failed");
/// }
/// ```
pub struct LabServer {
    state: AppState,
    host: IpAddr,
    port: u16,
}

impl LabServer {
    /// Create a server on `0.0.0.0` and the [`DEFAULT_PORT`].
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening address (builder-style).
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Serve until the process is killed.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot bind, or
    /// [`ServerError::Serve`] if the accept loop fails.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(%addr, "Fast Lab IO API listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("server stopped");
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
