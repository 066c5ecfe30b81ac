//! `Camera` trait and supporting types for image-capture hardware.

use fastlab_types::InstrumentFault;

use crate::instrument::Instrument;

/// A raw frame returned by a camera client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// 8-bit greyscale pixels, row-major, `width * height` bytes.
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Whether `data` holds exactly one byte per pixel.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() as u64 == u64::from(self.width) * u64::from(self.height)
    }
}

/// A camera behind a remote camera server.
pub trait Camera: Instrument {
    /// Grab the next frame.
    ///
    /// `Ok(None)` means the server answered without a frame.
    ///
    /// # Errors
    ///
    /// Returns the client's failure when acquisition fails.
    fn frame(&mut self) -> Result<Option<CameraFrame>, InstrumentFault>;

    /// # Errors
    ///
    /// Returns the client's failure when the exposure time is rejected.
    fn set_exposure_time(&mut self, exposure_time_us: f64) -> Result<(), InstrumentFault>;

    /// # Errors
    ///
    /// Returns the client's failure when the gain is rejected.
    fn set_gain(&mut self, gain: f64) -> Result<(), InstrumentFault>;
}

impl<T: Camera + ?Sized> Camera for Box<T> {
    fn frame(&mut self) -> Result<Option<CameraFrame>, InstrumentFault> {
        (**self).frame()
    }

    fn set_exposure_time(&mut self, exposure_time_us: f64) -> Result<(), InstrumentFault> {
        (**self).set_exposure_time(exposure_time_us)
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), InstrumentFault> {
        (**self).set_gain(gain)
    }
}

/// Type-erased camera client, as handed out by a camera connector.
pub type CameraHandle = Box<dyn Camera>;
