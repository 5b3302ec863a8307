//! Error taxonomy for RTU operations

use super::protocol::exception_description;
use super::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by client operations
#[derive(Error, Debug)]
pub enum RtuError {
    /// Inputs violate Modbus count/range bounds; raised before any I/O
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Serial open/read/write failure
    #[error(transparent)]
    Io(#[from] TransportError),

    /// Deadline exceeded without a parseable frame, after all retries
    #[error("Timed out waiting for a response")]
    Timeout,

    /// Frame arrived but failed CRC validation under every scheme and the
    /// structural check
    #[error("Response failed CRC validation")]
    Crc,

    /// Valid CRC but the unit ID or function code is unusable
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The slave answered with a Modbus exception
    #[error("Device exception {code:#04x} ({})", exception_description(*code))]
    Exception {
        /// Raw exception code byte
        code: u8,
    },

    /// The baudrate-switch protocol did not complete
    #[error("Baudrate switch to {target} failed: {reason}")]
    BaudrateSwitch {
        /// Requested baudrate
        target: u32,
        /// What went wrong, including whether the revert succeeded
        reason: String,
    },
}

impl RtuError {
    /// True for failures the transport engine retries (timeouts, CRC
    /// damage, I/O hiccups); exceptions and mismatches short-circuit
    pub fn is_retryable(&self) -> bool {
        matches!(self, RtuError::Timeout | RtuError::Crc | RtuError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_split() {
        assert!(RtuError::Timeout.is_retryable());
        assert!(RtuError::Crc.is_retryable());
        assert!(RtuError::Io(TransportError::NotConnected).is_retryable());
        assert!(!RtuError::Exception { code: 2 }.is_retryable());
        assert!(!RtuError::ProtocolMismatch("unit".into()).is_retryable());
        assert!(!RtuError::Validation("count".into()).is_retryable());
    }

    #[test]
    fn test_exception_display_names_code() {
        let err = RtuError::Exception { code: 0x02 };
        assert!(err.to_string().contains("Illegal Data Address"));
    }
}
