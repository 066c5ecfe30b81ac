//! In-process simulated instrument servers.
//!
//! [`SimMotorServer`] and [`SimCameraServer`] implement [`Connector`] and
//! hand out a fresh client on every connect.  Clients share the server's
//! physical state (the axis position survives reconnects, as it would on real
//! hardware) and its accounting, so tests can assert how many connects and
//! closes an operation caused.
//!
//! Faults are injected with builder methods before the server is shared:
//!
//! ```rust
//! use std::time::Duration;
//! use fastlab_hal::{Connector, Motor, MotorHandle, SimMotorServer};
//!
//! let server = SimMotorServer::new().with_call_latency(Duration::from_millis(1));
//! let mut motor: MotorHandle = server.connect("localhost", 7200).unwrap().unwrap();
//! motor.move_to(12.5).unwrap();
//! assert_eq!(motor.position().unwrap(), 12.5);
//! assert_eq!(server.connects(), 1);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use fastlab_types::InstrumentFault;
use tracing::debug;

use crate::camera::{Camera, CameraFrame, CameraHandle};
use crate::instrument::{Connector, Instrument};
use crate::motor::{Motor, MotorHandle};

// ────────────────────────────────────────────────────────────────────────────
// Fault injection and accounting
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimFaults {
    connect_delay: Duration,
    refuse: bool,
    connect_error: Option<String>,
    call_error: Option<String>,
    call_latency: Duration,
    closable: bool,
    close_error: Option<String>,
}

impl Default for SimFaults {
    fn default() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            refuse: false,
            connect_error: None,
            call_error: None,
            call_latency: Duration::ZERO,
            closable: true,
            close_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    calls: AtomicUsize,
}

impl SimFaults {
    /// Runs the connect side of the simulation; `Ok(false)` means refused.
    fn connect(&self, stats: &SimStats, host: &str, port: u16) -> Result<bool, InstrumentFault> {
        stats.connects.fetch_add(1, Ordering::SeqCst);
        debug!(host, port, "sim connect");
        if !self.connect_delay.is_zero() {
            thread::sleep(self.connect_delay);
        }
        if let Some(msg) = &self.connect_error {
            return Err(InstrumentFault::new(msg.clone()));
        }
        Ok(!self.refuse)
    }

    fn call(&self, stats: &SimStats, closed: bool) -> Result<(), InstrumentFault> {
        stats.calls.fetch_add(1, Ordering::SeqCst);
        if closed {
            return Err(InstrumentFault::new("client is closed"));
        }
        if !self.call_latency.is_zero() {
            thread::sleep(self.call_latency);
        }
        match &self.call_error {
            Some(msg) => Err(InstrumentFault::new(msg.clone())),
            None => Ok(()),
        }
    }

    fn close(&self, stats: &SimStats, closed: &mut bool) -> Option<Result<(), InstrumentFault>> {
        if !self.closable {
            return None;
        }
        stats.closes.fetch_add(1, Ordering::SeqCst);
        *closed = true;
        Some(match &self.close_error {
            Some(msg) => Err(InstrumentFault::new(msg.clone())),
            None => Ok(()),
        })
    }
}

/// Builder methods and counters shared by both simulated servers.
macro_rules! sim_server_common {
    ($server:ty) => {
        impl $server {
            /// Sleep this long inside every connect call.
            pub fn with_connect_delay(mut self, delay: Duration) -> Self {
                self.faults.connect_delay = delay;
                self
            }

            /// Answer connects without handing out a client.
            pub fn refusing(mut self) -> Self {
                self.faults.refuse = true;
                self
            }

            /// Fail every connect with `message`.
            pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
                self.faults.connect_error = Some(message.into());
                self
            }

            /// Fail every client call (not connect or close) with `message`.
            pub fn failing_calls(mut self, message: impl Into<String>) -> Self {
                self.faults.call_error = Some(message.into());
                self
            }

            /// Sleep this long inside every client call.
            pub fn with_call_latency(mut self, latency: Duration) -> Self {
                self.faults.call_latency = latency;
                self
            }

            /// Hand out clients that have no release capability.
            pub fn without_close(mut self) -> Self {
                self.faults.closable = false;
                self
            }

            /// Fail every close with `message`.
            pub fn failing_close(mut self, message: impl Into<String>) -> Self {
                self.faults.close_error = Some(message.into());
                self
            }

            /// Number of connect calls received, including refused and failed ones.
            pub fn connects(&self) -> usize {
                self.stats.connects.load(Ordering::SeqCst)
            }

            /// Number of close calls received.
            pub fn closes(&self) -> usize {
                self.stats.closes.load(Ordering::SeqCst)
            }

            /// Number of client calls received (excluding connect and close).
            pub fn calls(&self) -> usize {
                self.stats.calls.load(Ordering::SeqCst)
            }
        }
    };
}

// ────────────────────────────────────────────────────────────────────────────
// Motor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct AxisState {
    position: f64,
    speed: f64,
}

/// A simulated motor-control server driving a single axis.
///
/// Clones share the axis and the counters.
#[derive(Debug, Clone, Default)]
pub struct SimMotorServer {
    axis: Arc<Mutex<AxisState>>,
    stats: Arc<SimStats>,
    faults: SimFaults,
}

sim_server_common!(SimMotorServer);

impl SimMotorServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current axis position, read without going through a client.
    pub fn axis_position(&self) -> f64 {
        self.axis.lock().unwrap_or_else(PoisonError::into_inner).position
    }

    /// Current axis speed, read without going through a client.
    pub fn axis_speed(&self) -> f64 {
        self.axis.lock().unwrap_or_else(PoisonError::into_inner).speed
    }
}

impl Connector<MotorHandle> for SimMotorServer {
    fn connect(&self, host: &str, port: u16) -> Result<Option<MotorHandle>, InstrumentFault> {
        if !self.faults.connect(&self.stats, host, port)? {
            return Ok(None);
        }
        Ok(Some(Box::new(SimMotorClient {
            axis: Arc::clone(&self.axis),
            stats: Arc::clone(&self.stats),
            faults: self.faults.clone(),
            closed: false,
        })))
    }
}

/// Client handed out by [`SimMotorServer`].
pub struct SimMotorClient {
    axis: Arc<Mutex<AxisState>>,
    stats: Arc<SimStats>,
    faults: SimFaults,
    closed: bool,
}

impl Instrument for SimMotorClient {
    fn close(&mut self) -> Option<Result<(), InstrumentFault>> {
        self.faults.close(&self.stats, &mut self.closed)
    }
}

impl Motor for SimMotorClient {
    fn move_to(&mut self, position: f64) -> Result<(), InstrumentFault> {
        self.faults.call(&self.stats, self.closed)?;
        debug!(position, "sim motor move");
        self.axis.lock().unwrap_or_else(PoisonError::into_inner).position = position;
        Ok(())
    }

    fn position(&mut self) -> Result<f64, InstrumentFault> {
        self.faults.call(&self.stats, self.closed)?;
        Ok(self.axis.lock().unwrap_or_else(PoisonError::into_inner).position)
    }

    fn set_speed(&mut self, speed: f64) -> Result<(), InstrumentFault> {
        self.faults.call(&self.stats, self.closed)?;
        debug!(speed, "sim motor speed");
        self.axis.lock().unwrap_or_else(PoisonError::into_inner).speed = speed;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SensorState {
    exposure_time_us: f64,
    gain: f64,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            exposure_time_us: 1000.0,
            gain: 1.0,
        }
    }
}

/// A simulated camera server producing a moving greyscale test pattern.
///
/// Clones share the sensor settings, the frame counter and the counters.
#[derive(Debug, Clone)]
pub struct SimCameraServer {
    sensor: Arc<Mutex<SensorState>>,
    frame_counter: Arc<AtomicU64>,
    stats: Arc<SimStats>,
    faults: SimFaults,
    width: u32,
    height: u32,
    empty: bool,
}

sim_server_common!(SimCameraServer);

impl Default for SimCameraServer {
    fn default() -> Self {
        Self::new(320, 240)
    }
}

impl SimCameraServer {
    /// Camera producing `width` × `height` frames.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor: Arc::default(),
            frame_counter: Arc::default(),
            stats: Arc::default(),
            faults: SimFaults::default(),
            width,
            height,
            empty: false,
        }
    }

    /// Answer every frame request without a frame.
    pub fn without_frames(mut self) -> Self {
        self.empty = true;
        self
    }

    pub fn exposure_time_us(&self) -> f64 {
        self.sensor.lock().unwrap_or_else(PoisonError::into_inner).exposure_time_us
    }

    pub fn gain(&self) -> f64 {
        self.sensor.lock().unwrap_or_else(PoisonError::into_inner).gain
    }

    /// Number of frames produced so far.
    pub fn frames_served(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }
}

impl Connector<CameraHandle> for SimCameraServer {
    fn connect(&self, host: &str, port: u16) -> Result<Option<CameraHandle>, InstrumentFault> {
        if !self.faults.connect(&self.stats, host, port)? {
            return Ok(None);
        }
        Ok(Some(Box::new(SimCameraClient {
            server: self.clone(),
            closed: false,
        })))
    }
}

/// Client handed out by [`SimCameraServer`].
pub struct SimCameraClient {
    server: SimCameraServer,
    closed: bool,
}

impl Instrument for SimCameraClient {
    fn close(&mut self) -> Option<Result<(), InstrumentFault>> {
        self.server.faults.close(&self.server.stats, &mut self.closed)
    }
}

impl Camera for SimCameraClient {
    fn frame(&mut self) -> Result<Option<CameraFrame>, InstrumentFault> {
        self.server.faults.call(&self.server.stats, self.closed)?;
        if self.server.empty {
            return Ok(None);
        }
        let n = self.server.frame_counter.fetch_add(1, Ordering::SeqCst);
        let (width, height) = (self.server.width, self.server.height);
        // Diagonal gradient that drifts one pixel per frame.
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| ((u64::from(x) + u64::from(y) + n) % 256) as u8))
            .collect();
        Ok(Some(CameraFrame {
            width,
            height,
            data,
        }))
    }

    fn set_exposure_time(&mut self, exposure_time_us: f64) -> Result<(), InstrumentFault> {
        self.server.faults.call(&self.server.stats, self.closed)?;
        debug!(exposure_time_us, "sim camera exposure");
        self.server
            .sensor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .exposure_time_us = exposure_time_us;
        Ok(())
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), InstrumentFault> {
        self.server.faults.call(&self.server.stats, self.closed)?;
        debug!(gain, "sim camera gain");
        self.server.sensor.lock().unwrap_or_else(PoisonError::into_inner).gain = gain;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn connect_motor(server: &SimMotorServer) -> MotorHandle {
        server
            .connect("localhost", 7200)
            .expect("connect must succeed")
            .expect("server must hand out a client")
    }

    #[test]
    fn motor_state_survives_reconnects() {
        let server = SimMotorServer::new();
        let mut first = connect_motor(&server);
        first.move_to(3.25).unwrap();
        first.set_speed(40.0).unwrap();
        assert!(matches!(first.close(), Some(Ok(()))));

        let mut second = connect_motor(&server);
        assert_eq!(second.position().unwrap(), 3.25);
        assert_eq!(server.axis_speed(), 40.0);
        assert_eq!(server.connects(), 2);
        assert_eq!(server.closes(), 1);
        assert_eq!(server.calls(), 3);
    }

    #[test]
    fn refusing_server_hands_out_nothing() {
        let server = SimMotorServer::new().refusing();
        assert!(server.connect("localhost", 7200).unwrap().is_none());
        assert_eq!(server.connects(), 1);
    }

    #[test]
    fn failing_connect_reports_message() {
        let server = SimMotorServer::new().failing_connect("connection refused");
        let err = server.connect("localhost", 7200).err().unwrap();
        assert_eq!(err.message(), "connection refused");
    }

    #[test]
    fn connect_delay_blocks_the_caller() {
        let server = SimMotorServer::new().with_connect_delay(Duration::from_millis(30));
        let started = Instant::now();
        let _ = connect_motor(&server);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn failing_calls_leave_axis_untouched() {
        let server = SimMotorServer::new().failing_calls("axis fault");
        let mut motor = connect_motor(&server);
        assert_eq!(motor.move_to(9.0).unwrap_err().message(), "axis fault");
        assert_eq!(server.axis_position(), 0.0);
    }

    #[test]
    fn closed_client_rejects_calls() {
        let server = SimMotorServer::new();
        let mut motor = connect_motor(&server);
        motor.close();
        assert!(motor.position().is_err());
    }

    #[test]
    fn client_without_close_capability() {
        let server = SimMotorServer::new().without_close();
        let mut motor = connect_motor(&server);
        assert!(motor.close().is_none());
        assert_eq!(server.closes(), 0);
    }

    #[test]
    fn failing_close_is_counted() {
        let server = SimMotorServer::new().failing_close("socket already gone");
        let mut motor = connect_motor(&server);
        assert!(matches!(motor.close(), Some(Err(_))));
        assert_eq!(server.closes(), 1);
    }

    #[test]
    fn camera_frames_drift() {
        let server = SimCameraServer::new(8, 4);
        let mut cam = server.connect("localhost", 7100).unwrap().unwrap();
        let a = cam.frame().unwrap().unwrap();
        let b = cam.frame().unwrap().unwrap();
        assert!(a.is_well_formed());
        assert_eq!((a.width, a.height), (8, 4));
        assert_ne!(a.data, b.data);
        assert_eq!(server.frames_served(), 2);
    }

    #[test]
    fn camera_settings_persist_on_server() {
        let server = SimCameraServer::default();
        let mut cam = server.connect("localhost", 7100).unwrap().unwrap();
        cam.set_exposure_time(5000.0).unwrap();
        cam.set_gain(2.5).unwrap();
        assert_eq!(server.exposure_time_us(), 5000.0);
        assert_eq!(server.gain(), 2.5);
    }

    #[test]
    fn camera_without_frames_answers_none() {
        let server = SimCameraServer::default().without_frames();
        let mut cam = server.connect("localhost", 7100).unwrap().unwrap();
        assert!(cam.frame().unwrap().is_none());
    }
}
