//! # Modlink
//!
//! A Modbus RTU client library for serial/RS-485 field devices with
//! support for:
//! - The four standard read functions (coils, discrete inputs, holding
//!   and input registers) and four write functions
//! - Quirk-tolerant frame validation for Waveshare modules (swapped CRC
//!   trailers, mismatched function codes, short frames, broadcast echoes)
//! - Half-duplex RS-485 pacing, adaptive framing and retry policy
//! - Per-device state tracking with JSON dumps
//! - Device discovery (port × baudrate × unit-ID sweep)
//! - In-place baudrate renegotiation via register 0x2000
//!
//! ## Example
//!
//! ```rust,no_run
//! use modlink::{ClientConfig, RtuClient};
//!
//! fn main() -> Result<(), modlink::RtuError> {
//!     let client = RtuClient::new(ClientConfig::new("/dev/ttyACM0", 9600));
//!     client.connect()?;
//!
//!     let coils = client.read_coils(1, 0, 8)?;
//!     println!("coils 0-7: {coils:?}");
//!
//!     client.write_single_coil(1, 0, true)?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::config::{AutoDetectSettings, LinkSettings, SettingsError};
pub use crate::core::client::{ClientConfig, RtuClient};
pub use crate::core::device_state::{
    registry, BitKind, DeviceCounters, DeviceRegistry, DeviceState, DeviceVariant, PersistError,
    RegisterKind,
};
pub use crate::core::discovery::{autodetect, scan_devices, DeviceConfig, DiscoveryOptions};
pub use crate::core::engine::{RtuResponse, RtuTransport};
pub use crate::core::error::RtuError;
pub use crate::core::protocol::{CrcScheme, ExceptionCode, FunctionCode, ParseOutcome, ResponseFlags};
pub use crate::core::transport::{available_ports, MockLink, SerialLink, SerialPortLink, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
