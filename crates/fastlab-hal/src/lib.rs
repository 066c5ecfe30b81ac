//! `fastlab-hal` – the instrument client surface.
//!
//! Vendor instrument-control libraries are blocking and synchronous: a
//! `connect(host, port)` hands out a client, each client call may block for
//! as long as the remote server likes, and any of them may fail.  This crate
//! captures that contract as plain traits so the rest of the workspace never
//! depends on a concrete vendor library.
//!
//! # Modules
//!
//! - [`instrument`] – [`Instrument`] (optional release capability) and
//!   [`Connector`] (the `connect` call).
//! - [`motor`] – [`Motor`]: move, read position, set speed.
//! - [`camera`] – [`Camera`] and [`CameraFrame`]: grab frames, set exposure
//!   and gain.
//! - [`sim`] – in-process simulated instrument servers with connect/close
//!   accounting and fault injection, used by the `fastlab` binary and by
//!   every test in the workspace.

pub mod camera;
pub mod instrument;
pub mod motor;
pub mod sim;

pub use camera::{Camera, CameraFrame, CameraHandle};
pub use instrument::{Connector, Instrument};
pub use motor::{Motor, MotorHandle};
pub use sim::{SimCameraServer, SimMotorServer};
