//! CRC-16 computation and frame validation for Modbus RTU
//!
//! Primary scheme: polynomial 0xA001 (reflected 0x8005), init 0xFFFF,
//! emitted low byte first. Waveshare modules damage the CRC trailer in
//! predictable ways, so a secondary ladder of alternative interpretations
//! is tried when the primary check fails.

use tracing::debug;

/// Alternative CRC interpretation that matched a quirky frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcScheme {
    /// Trailer bytes were swapped (big-endian emission)
    Swapped,
    /// CRC computed with init value 0x0000 instead of 0xFFFF
    ZeroInit,
    /// CRC computed with polynomial 0x8408 (CCITT-reflected)
    Ccitt,
}

impl CrcScheme {
    /// Get name of the scheme, for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            CrcScheme::Swapped => "byte-swapped",
            CrcScheme::ZeroInit => "zero-init",
            CrcScheme::Ccitt => "ccitt-reflected",
        }
    }
}

/// Result of tolerant frame validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    /// Trailer matches the primary Modbus CRC-16
    Valid,
    /// Trailer matches one of the alternative schemes
    Quirk(CrcScheme),
    /// Trailer matches nothing we recognize
    Invalid,
}

/// Calculate Modbus CRC-16 over `data`
///
/// Polynomial 0xA001 (reflected 0x8005), init 0xFFFF, bit-reflected input.
/// Callers append the result low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with(data, 0xFFFF, 0xA001)
}

fn crc16_with(data: &[u8], init: u16, poly: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Verify a full frame against its little-endian CRC trailer (primary scheme only)
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let split = frame.len() - 2;
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    crc16(&frame[..split]) == received
}

/// Verify a full frame, falling back to the quirk ladder when the primary check fails
///
/// Quirk order: byte-swapped trailer, init 0x0000, polynomial 0x8408. The
/// first match wins and is reported so the device state can count it.
pub fn verify_tolerant(frame: &[u8]) -> CrcStatus {
    if frame.len() < 3 {
        return CrcStatus::Invalid;
    }
    let split = frame.len() - 2;
    let body = &frame[..split];
    let received_le = u16::from_le_bytes([frame[split], frame[split + 1]]);
    let received_be = u16::from_be_bytes([frame[split], frame[split + 1]]);

    let primary = crc16(body);
    if primary == received_le {
        return CrcStatus::Valid;
    }

    let scheme = if primary == received_be {
        Some(CrcScheme::Swapped)
    } else if crc16_with(body, 0x0000, 0xA001) == received_le {
        Some(CrcScheme::ZeroInit)
    } else if crc16_with(body, 0xFFFF, 0x8408) == received_le {
        Some(CrcScheme::Ccitt)
    } else {
        None
    };

    match scheme {
        Some(s) => {
            debug!(scheme = s.name(), frame = %hex::encode(frame), "frame accepted via alternative CRC");
            CrcStatus::Quirk(s)
        }
        None => CrcStatus::Invalid,
    }
}
