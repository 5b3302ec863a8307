//! Serial link abstraction for the RTU transport engine
//!
//! One trait, two implementations: a real `serialport`-backed link and a
//! scripted in-memory mock used by the test scenarios. The engine only ever
//! talks to the trait, so swapping hardware out from under it is a
//! constructor argument, not a patch.

mod mock;
mod serial;

pub use mock::MockLink;
pub use serial::{available_ports, SerialPortLink};

use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Port path does not exist or disappeared
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Insufficient permissions to open the port
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Open failed for another reason
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation attempted on a closed link
    #[error("Not connected")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking byte-level access to one half-duplex serial device
///
/// All methods are synchronous; the transport engine provides the timing
/// discipline (pacing, settle delays, deadlines) on top.
pub trait SerialLink: Send {
    /// Open the device at the currently configured baudrate
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the device; safe to call when already closed
    fn close(&mut self);

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Port path or identifier
    fn name(&self) -> &str;

    /// Currently configured baudrate
    fn baudrate(&self) -> u32;

    /// Reconfigure the baudrate, applying it to the live handle when open
    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError>;

    /// Append whatever bytes have already arrived to `buf`, returning the
    /// number added; never blocks beyond the link's short poll interval
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, TransportError>;

    /// Write all bytes and block until the OS buffer has drained
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Discard unread input
    fn flush_input(&mut self) -> Result<(), TransportError>;

    /// Discard unsent output
    fn flush_output(&mut self) -> Result<(), TransportError>;
}
