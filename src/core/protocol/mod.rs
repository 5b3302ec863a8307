//! Modbus RTU protocol layer
//!
//! Function/exception codes (including the Waveshare vendor aliases),
//! request frame builders and the tolerant response parser.

pub mod crc;
pub mod frame;

pub use crc::{CrcScheme, CrcStatus};
pub use frame::{ParseOutcome, ResponseFlags};

use tracing::warn;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Get function code from u8, resolving Waveshare vendor aliases
    pub fn from_u8(code: u8) -> Option<Self> {
        match canonical(code) {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Get name of function code
    pub fn name(&self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    /// True for the four read functions
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// True for write-single-coil / write-single-register
    pub fn is_single_write(&self) -> bool {
        matches!(self, FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister)
    }

    /// True for write-multiple-coils / write-multiple-registers
    pub fn is_multi_write(&self) -> bool {
        matches!(self, FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters)
    }
}

/// Waveshare alias for read-coils
pub const VENDOR_READ_COILS: u8 = 0x41;
/// Waveshare alias for read-holding-registers
pub const VENDOR_READ_HOLDING: u8 = 0x43;
/// Waveshare alias for read-input-registers
pub const VENDOR_READ_INPUT: u8 = 0x44;

/// Map Waveshare vendor aliases onto their canonical function codes
pub fn canonical(code: u8) -> u8 {
    match code {
        VENDOR_READ_COILS => 0x01,
        VENDOR_READ_HOLDING => 0x03,
        VENDOR_READ_INPUT => 0x04,
        other => other,
    }
}

/// Function-code pairs treated as interchangeable in responses
///
/// Superset of the tolerance rules observed across Waveshare modules.
/// The 0x01/0x05 pair has no documented justification and is only honored
/// with a warning.
const COMPATIBLE_FUNCTIONS: &[(u8, u8)] = &[
    (0x01, 0x41),
    (0x03, 0x43),
    (0x04, 0x44),
    (0x01, 0x02),
    (0x03, 0x04),
    (0x05, 0x0F),
    (0x06, 0x10),
    (0x01, 0x05),
    (0x03, 0x06),
];

/// Check whether a mismatched response function code is acceptable for `expected`
pub fn functions_compatible(expected: u8, received: u8) -> bool {
    if expected == received {
        return true;
    }
    for &(a, b) in COMPATIBLE_FUNCTIONS {
        if (expected == a && received == b) || (expected == b && received == a) {
            if (a, b) == (0x01, 0x05) {
                warn!(
                    expected = format_args!("{expected:#04x}"),
                    received = format_args!("{received:#04x}"),
                    "accepting undocumented read-coils/write-coil function code pairing"
                );
            }
            return true;
        }
    }
    false
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported by the device
    IllegalFunction = 0x01,
    /// Data address out of range
    IllegalDataAddress = 0x02,
    /// Value not accepted for the address
    IllegalDataValue = 0x03,
    /// Unrecoverable device-side failure
    SlaveDeviceFailure = 0x04,
    /// Long-running request accepted, result pending
    Acknowledge = 0x05,
    /// Device busy, retry later
    SlaveDeviceBusy = 0x06,
    /// Program-function rejection
    NegativeAcknowledge = 0x07,
    /// Extended memory parity error
    MemoryParityError = 0x08,
    /// Gateway misconfigured or overloaded
    GatewayPathUnavailable = 0x0A,
    /// Gateway target did not respond
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Get exception from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::SlaveDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::SlaveDeviceBusy),
            0x07 => Some(ExceptionCode::NegativeAcknowledge),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    /// Get name of exception
    pub fn name(&self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveDeviceFailure => "Slave Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveDeviceBusy => "Slave Device Busy",
            ExceptionCode::NegativeAcknowledge => "Negative Acknowledge",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "Gateway Target Failed to Respond",
        }
    }
}

/// Human-readable description for a raw exception code byte
pub fn exception_description(code: u8) -> &'static str {
    ExceptionCode::from_u8(code).map_or("Unknown Exception", |e| e.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_aliases_resolve() {
        assert_eq!(FunctionCode::from_u8(0x41), Some(FunctionCode::ReadCoils));
        assert_eq!(FunctionCode::from_u8(0x43), Some(FunctionCode::ReadHoldingRegisters));
        assert_eq!(FunctionCode::from_u8(0x44), Some(FunctionCode::ReadInputRegisters));
        assert_eq!(FunctionCode::from_u8(0x42), None);
    }

    #[test]
    fn test_compatibility_is_symmetric() {
        assert!(functions_compatible(0x01, 0x41));
        assert!(functions_compatible(0x41, 0x01));
        assert!(functions_compatible(0x03, 0x04));
        assert!(functions_compatible(0x04, 0x03));
        assert!(functions_compatible(0x05, 0x0F));
        assert!(functions_compatible(0x01, 0x05));
        assert!(!functions_compatible(0x02, 0x10));
        assert!(!functions_compatible(0x0F, 0x10));
    }

    #[test]
    fn test_exception_descriptions() {
        assert_eq!(exception_description(0x02), "Illegal Data Address");
        assert_eq!(exception_description(0x0B), "Gateway Target Failed to Respond");
        assert_eq!(exception_description(0x7F), "Unknown Exception");
    }
}
