//! `fastlab` – Fast Lab IO gateway binary
//!
//! 1. Parses the command line and loads `~/.fastlab/config.toml` (or the
//!    file given with `--config`), then applies `FASTLAB_*` overrides.
//! 2. Installs the `tracing` subscriber (optionally exporting spans over
//!    OTLP).
//! 3. Builds a tokio runtime whose blocking pool is capped at
//!    `server.max_blocking_threads`; every instrument call runs there.
//! 4. Serves the HTTP/WebSocket API until Ctrl-C, then drains in-flight
//!    requests and exits.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fastlab_broker::ConnectionBroker;
use fastlab_hal::{CameraHandle, MotorHandle, SimCameraServer, SimMotorServer};
use fastlab_server::{AppState, LabServer, ServerError};
use tracing::{error, info, warn};

use crate::config::Config;

/// Command line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "HTTP/WebSocket gateway for laboratory instruments",
    long_about = "Serves REST and WebSocket endpoints for a motorized stage and a camera.\n\n\
        Each request opens its own connection to the instrument server, bounded by \
        the configured connect timeout, and closes it before responding."
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Config file (default: ~/.fastlab/config.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Listening port; overrides the config file and FASTLAB_PORT"
    )]
    port: Option<u16>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = telemetry::init_tracing("fastlab");

    let mut cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    info!(?cfg, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cfg.server.max_blocking_threads)
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(cfg: Config) -> Result<(), ServerError> {
    LabServer::new(build_state(&cfg))
        .with_host(cfg.server.host)
        .with_port(cfg.server.port)
        .run_until(shutdown_signal())
        .await
}

/// Wire the brokers to the simulated instrument servers.
fn build_state(cfg: &Config) -> AppState {
    info!(
        motor = %cfg.motor.endpoint().address(),
        camera = %cfg.camera.endpoint().address(),
        "serving simulated instruments"
    );

    let motor_sim = SimMotorServer::new().with_call_latency(Duration::from_millis(cfg.motor.sim_latency_ms));
    let camera_sim = SimCameraServer::new(cfg.camera.sim_width, cfg.camera.sim_height)
        .with_call_latency(Duration::from_millis(cfg.camera.sim_latency_ms));

    let mut motor: ConnectionBroker<MotorHandle> = ConnectionBroker::new(cfg.motor.endpoint(), Arc::new(motor_sim));
    if cfg.motor.exclusive {
        motor = motor.exclusive();
    }
    let mut camera: ConnectionBroker<CameraHandle> =
        ConnectionBroker::new(cfg.camera.endpoint(), Arc::new(camera_sim));
    if cfg.camera.exclusive {
        camera = camera.exclusive();
    }

    AppState::new(motor, camera)
        .with_motor_pacing(cfg.motor.stream_pacing())
        .with_camera_pacing(cfg.camera.stream_pacing())
        .with_jpeg_quality(cfg.camera.jpeg_quality)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received; shutting down"),
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
