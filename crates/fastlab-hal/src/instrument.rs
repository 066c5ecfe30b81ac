//! Base traits shared by every instrument client.

use fastlab_types::InstrumentFault;

/// A live client connection to a remote instrument-control server.
///
/// Every call on an instrument may block for an unbounded time, so callers
/// must never invoke these methods directly from an async task; they go
/// through `fastlab_broker::offload`.
pub trait Instrument: Send + 'static {
    /// Release the connection.
    ///
    /// Returns `None` when the client has no release capability, which is the
    /// default; clients that hold a socket or session override this.
    fn close(&mut self) -> Option<Result<(), InstrumentFault>> {
        None
    }
}

impl<T: Instrument + ?Sized> Instrument for Box<T> {
    fn close(&mut self) -> Option<Result<(), InstrumentFault>> {
        (**self).close()
    }
}

/// The `connect(host, port)` entry point of a vendor client library.
///
/// `Ok(None)` means the server was reachable but did not hand out a working
/// client.
pub trait Connector<H>: Send + Sync {
    /// # Errors
    ///
    /// Returns the client library's failure when the connection attempt
    /// itself fails.
    fn connect(&self, host: &str, port: u16) -> Result<Option<H>, InstrumentFault>;
}
