//! Request frame construction and tolerant response parsing
//!
//! Building is strict Modbus RTU. Parsing is deliberately lenient: real
//! RS-485 modules (Waveshare in particular) return swapped CRC bytes,
//! mismatched function codes, broadcast unit IDs and short frames, and the
//! acceptance rules here are ordered so that a damaged-but-structurally-sound
//! frame is still usable while genuine garbage is rejected.

use super::crc::{self, CrcScheme, CrcStatus};
use super::{canonical, functions_compatible, FunctionCode};
use tracing::{debug, warn};

/// Qualifiers attached to an accepted response frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFlags {
    /// Frame was accepted via an alternative CRC interpretation
    pub crc_scheme: Option<CrcScheme>,
    /// No CRC interpretation matched; accepted on structure alone
    pub crc_unreliable: bool,
    /// Function code differed from the request but was accepted
    pub function_quirk: bool,
    /// Device answered with the broadcast unit ID 0
    pub broadcast_unit: bool,
}

impl ResponseFlags {
    /// True when any tolerance rule fired for this frame
    pub fn is_degraded(&self) -> bool {
        self.crc_scheme.is_some() || self.crc_unreliable || self.function_quirk || self.broadcast_unit
    }
}

/// Why a frame was rejected outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// CRC failed under every scheme and the structure is inconsistent
    Crc,
    /// Exception flag set but the frame is shorter than five bytes
    ShortException,
    /// Unit ID is neither the expected one nor an accepted quirk form
    UnitMismatch,
    /// Function code outside every compatibility class
    FunctionMismatch,
}

impl InvalidReason {
    /// Short description for error messages
    pub fn describe(&self) -> &'static str {
        match self {
            InvalidReason::Crc => "CRC validation failed",
            InvalidReason::ShortException => "truncated exception frame",
            InvalidReason::UnitMismatch => "unit ID mismatch",
            InvalidReason::FunctionMismatch => "function code mismatch",
        }
    }
}

/// Result of parsing a response buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Frame accepted; payload is everything between the header and the CRC
    Ok {
        /// Payload bytes, `frame[2..len-2]`
        payload: Vec<u8>,
        /// Tolerance rules that fired during acceptance
        flags: ResponseFlags,
    },
    /// Device answered with a Modbus exception
    Exception {
        /// Echoed function code with the exception bit cleared
        function: u8,
        /// Exception code byte
        code: u8,
    },
    /// Not enough bytes yet to be any valid frame
    Incomplete,
    /// Frame cannot be used
    Invalid(InvalidReason),
}

// ============ Request builders ============

/// Assemble `unit_id || function_code || payload || crc_le`
pub fn build_frame(unit_id: u8, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(unit_id);
    frame.push(function_code);
    frame.extend_from_slice(payload);
    let crc = crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build a read request (FC 0x01-0x04): `addr_be || count_be`
pub fn read_request(unit_id: u8, function: FunctionCode, address: u16, count: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&address.to_be_bytes());
    payload[2..].copy_from_slice(&count.to_be_bytes());
    build_frame(unit_id, function as u8, &payload)
}

/// Build a write-single-coil request (FC 0x05); true maps to 0xFF00, false to 0x0000
pub fn write_single_coil_request(unit_id: u8, address: u16, value: bool) -> Vec<u8> {
    let coil_value: u16 = if value { 0xFF00 } else { 0x0000 };
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&address.to_be_bytes());
    payload[2..].copy_from_slice(&coil_value.to_be_bytes());
    build_frame(unit_id, FunctionCode::WriteSingleCoil as u8, &payload)
}

/// Build a write-single-register request (FC 0x06)
pub fn write_single_register_request(unit_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&address.to_be_bytes());
    payload[2..].copy_from_slice(&value.to_be_bytes());
    build_frame(unit_id, FunctionCode::WriteSingleRegister as u8, &payload)
}

/// Build a write-multiple-coils request (FC 0x0F) with LSB-first bit packing
pub fn write_multiple_coils_request(unit_id: u8, address: u16, values: &[bool]) -> Vec<u8> {
    let count = values.len() as u16;
    let packed = pack_bits(values);
    let mut payload = Vec::with_capacity(5 + packed.len());
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    payload.push(packed.len() as u8);
    payload.extend_from_slice(&packed);
    build_frame(unit_id, FunctionCode::WriteMultipleCoils as u8, &payload)
}

/// Build a write-multiple-registers request (FC 0x10)
pub fn write_multiple_registers_request(unit_id: u8, address: u16, values: &[u16]) -> Vec<u8> {
    let count = values.len() as u16;
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    build_frame(unit_id, FunctionCode::WriteMultipleRegisters as u8, &payload)
}

/// Pack coil values into bytes, bit `i` at `packed[i/8]` bit `i%8`
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

// ============ Response parsing ============

/// Parse and validate a response buffer
///
/// `request_payload` is the payload of the request this buffer answers; it
/// lets the structural check confirm a write echo when the CRC or function
/// code cannot be trusted.
pub fn parse_response(
    frame: &[u8],
    expected_unit: u8,
    expected_function: u8,
    request_payload: Option<&[u8]>,
) -> ParseOutcome {
    if frame.len() < 4 {
        return ParseOutcome::Incomplete;
    }

    let mut flags = ResponseFlags::default();

    match crc::verify_tolerant(frame) {
        CrcStatus::Valid => {}
        CrcStatus::Quirk(scheme) => flags.crc_scheme = Some(scheme),
        CrcStatus::Invalid => {
            if structurally_consistent(frame, expected_function, request_payload) {
                warn!(
                    frame = %hex::encode(frame),
                    "CRC failed under every scheme, continuing on structural consistency"
                );
                flags.crc_unreliable = true;
            } else {
                return ParseOutcome::Invalid(InvalidReason::Crc);
            }
        }
    }

    let unit_id = frame[0];
    let function_code = frame[1];

    if function_code & 0x80 != 0 {
        if frame.len() < 5 {
            return ParseOutcome::Invalid(InvalidReason::ShortException);
        }
        return ParseOutcome::Exception {
            function: function_code & 0x7F,
            code: frame[2],
        };
    }

    if unit_id != expected_unit {
        if unit_id == 0 {
            warn!(expected_unit, "device echoed the broadcast unit ID");
            flags.broadcast_unit = true;
        } else {
            // expected+0x80 is only legal together with an exception
            // function code, which the branch above already consumed
            return ParseOutcome::Invalid(InvalidReason::UnitMismatch);
        }
    }

    if canonical(function_code) != canonical(expected_function) {
        if functions_compatible(expected_function, function_code) {
            debug!(
                expected = format_args!("{expected_function:#04x}"),
                received = format_args!("{function_code:#04x}"),
                "accepting compatible function code"
            );
            flags.function_quirk = true;
        } else if is_write(expected_function)
            && structurally_consistent(frame, expected_function, request_payload)
        {
            warn!(
                expected = format_args!("{expected_function:#04x}"),
                received = format_args!("{function_code:#04x}"),
                "function code unusable but frame is a valid write echo"
            );
            flags.function_quirk = true;
        } else {
            return ParseOutcome::Invalid(InvalidReason::FunctionMismatch);
        }
    }

    ParseOutcome::Ok {
        payload: frame[2..frame.len() - 2].to_vec(),
        flags,
    }
}

fn is_write(function_code: u8) -> bool {
    FunctionCode::from_u8(function_code)
        .is_some_and(|f| f.is_single_write() || f.is_multi_write())
}

/// Check that a frame's length and payload agree with the shape the
/// expected function implies
///
/// Used both for CRC-tolerant acceptance and for adaptive framing in the
/// transport engine.
pub fn structurally_consistent(
    frame: &[u8],
    expected_function: u8,
    request_payload: Option<&[u8]>,
) -> bool {
    match canonical(expected_function) {
        0x01..=0x04 => frame.len() >= 5 && frame.len() == 3 + frame[2] as usize + 2,
        // single and multiple writes both echo the first four payload bytes
        // of the request (addr+value, or addr+count) in an 8-byte frame
        0x05 | 0x06 | 0x0F | 0x10 => {
            frame.len() == 8
                && request_payload
                    .map_or(true, |req| req.len() >= 4 && frame[2..6] == req[..4])
        }
        _ => false,
    }
}

// ============ Payload decoders ============

/// Decode a coil/discrete-input read payload into `count` booleans
///
/// First byte is the byte count; bits unpack LSB-first and trailing bits in
/// the last byte are ignored.
pub fn decode_bits(payload: &[u8], count: u16) -> Result<Vec<bool>, &'static str> {
    if payload.is_empty() {
        return Err("empty bit payload");
    }
    let needed = (count as usize).div_ceil(8);
    let byte_count = payload[0] as usize;
    if byte_count < needed || payload.len() < 1 + needed {
        return Err("bit payload shorter than requested count");
    }
    Ok((0..count as usize)
        .map(|i| payload[1 + i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Decode a register read payload into `count` big-endian words
pub fn decode_registers(payload: &[u8], count: u16) -> Result<Vec<u16>, &'static str> {
    if payload.is_empty() {
        return Err("empty register payload");
    }
    let byte_count = payload[0] as usize;
    if byte_count != count as usize * 2 {
        return Err("register byte count disagrees with requested count");
    }
    if payload.len() < 1 + byte_count {
        return Err("register payload shorter than advertised");
    }
    Ok(payload[1..1 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_payload(outcome: ParseOutcome) -> (Vec<u8>, ResponseFlags) {
        match outcome {
            ParseOutcome::Ok { payload, flags } => (payload, flags),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn test_read_request_bytes() {
        // 01 01 00 00 00 08 3D CC
        let frame = read_request(1, FunctionCode::ReadCoils, 0, 8);
        assert_eq!(frame, vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x08, 0x3D, 0xCC]);
    }

    #[test]
    fn test_write_single_coil_encoding() {
        // 01 05 00 00 FF 00 8C 3A
        let on = write_single_coil_request(1, 0, true);
        assert_eq!(on, vec![0x01, 0x05, 0x00, 0x00, 0xFF, 0x00, 0x8C, 0x3A]);
        let off = write_single_coil_request(1, 0, false);
        assert_eq!(&off[2..6], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_coils_packing() {
        let frame = write_multiple_coils_request(1, 0x10, &[true, false, true, false, false, false, false, false, true]);
        // addr, count=9, byte_count=2, bits 0b00000101 / 0b00000001
        assert_eq!(&frame[2..9], &[0x00, 0x10, 0x00, 0x09, 0x02, 0x05, 0x01]);
    }

    #[test]
    fn test_write_multiple_registers_payload() {
        let frame = write_multiple_registers_request(1, 2, &[0x1234, 0x5678]);
        assert_eq!(&frame[2..11], &[0x00, 0x02, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_frame_roundtrip_every_function() {
        let cases: Vec<(u8, Vec<u8>)> = vec![
            (0x01, vec![0x01, 0x55]),
            (0x02, vec![0x01, 0xAA]),
            (0x03, vec![0x04, 0x12, 0x34, 0x56, 0x78]),
            (0x04, vec![0x02, 0x00, 0x2A]),
            (0x05, vec![0x00, 0x07, 0xFF, 0x00]),
            (0x06, vec![0x00, 0x07, 0x12, 0x34]),
            (0x0F, vec![0x00, 0x00, 0x00, 0x09]),
            (0x10, vec![0x00, 0x02, 0x00, 0x02]),
        ];
        for (function, payload) in cases {
            let frame = build_frame(0x11, function, &payload);
            let (parsed, flags) = ok_payload(parse_response(&frame, 0x11, function, None));
            assert_eq!(parsed, payload, "function {function:#04x}");
            assert!(!flags.is_degraded());
        }
    }

    #[test]
    fn test_parse_exception() {
        // 01 83 02 C0 F1
        let frame = build_frame(1, 0x83, &[0x02]);
        assert_eq!(
            parse_response(&frame, 1, 0x03, None),
            ParseOutcome::Exception { function: 0x03, code: 0x02 }
        );
    }

    #[test]
    fn test_parse_short_buffer_incomplete() {
        assert_eq!(parse_response(&[0x01, 0x03, 0x02], 1, 0x03, None), ParseOutcome::Incomplete);
    }

    #[test]
    fn test_parse_rejects_wrong_unit() {
        let frame = build_frame(5, 0x03, &[0x02, 0x00, 0x2A]);
        assert_eq!(
            parse_response(&frame, 1, 0x03, None),
            ParseOutcome::Invalid(InvalidReason::UnitMismatch)
        );
    }

    #[test]
    fn test_parse_accepts_broadcast_unit_with_flag() {
        let frame = build_frame(0, 0x03, &[0x02, 0x00, 0x2A]);
        let (_, flags) = ok_payload(parse_response(&frame, 1, 0x03, None));
        assert!(flags.broadcast_unit);
    }

    #[test]
    fn test_parse_accepts_vendor_alias_silently() {
        let frame = build_frame(1, 0x41, &[0x01, 0x55]);
        let (payload, flags) = ok_payload(parse_response(&frame, 1, 0x01, None));
        assert_eq!(payload, vec![0x01, 0x55]);
        assert!(!flags.function_quirk);
    }

    #[test]
    fn test_parse_flags_compatible_function() {
        let frame = build_frame(1, 0x04, &[0x02, 0x00, 0x2A]);
        let (_, flags) = ok_payload(parse_response(&frame, 1, 0x03, None));
        assert!(flags.function_quirk);
    }

    #[test]
    fn test_parse_rejects_incompatible_function() {
        let frame = build_frame(1, 0x10, &[0x02, 0x00, 0x2A]);
        assert_eq!(
            parse_response(&frame, 1, 0x02, None),
            ParseOutcome::Invalid(InvalidReason::FunctionMismatch)
        );
    }

    #[test]
    fn test_parse_swapped_crc_flagged() {
        let body = [0x01u8, 0x01, 0x01, 0x55];
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc::crc16(&body).to_be_bytes());
        let (payload, flags) = ok_payload(parse_response(&frame, 1, 0x01, None));
        assert_eq!(payload, vec![0x01, 0x55]);
        assert_eq!(flags.crc_scheme, Some(CrcScheme::Swapped));
    }

    #[test]
    fn test_parse_bad_crc_good_structure_flagged_unreliable() {
        // read response with coherent byte count but unrecognizable CRC
        let frame = [0x01u8, 0x03, 0x02, 0x00, 0x2A, 0xDE, 0xAD];
        let (payload, flags) = ok_payload(parse_response(&frame, 1, 0x03, None));
        assert_eq!(payload, vec![0x02, 0x00, 0x2A]);
        assert!(flags.crc_unreliable);
    }

    #[test]
    fn test_parse_bad_crc_bad_structure_invalid() {
        // byte count says 9 but the frame is 7 bytes
        let frame = [0x01u8, 0x03, 0x09, 0x00, 0x2A, 0xDE, 0xAD];
        assert_eq!(
            parse_response(&frame, 1, 0x03, None),
            ParseOutcome::Invalid(InvalidReason::Crc)
        );
    }

    #[test]
    fn test_write_echo_with_alien_function_code() {
        // write echo comes back with a function code outside every class;
        // the request payload confirms it is our echo
        let request = write_single_register_request(1, 7, 0x1234);
        let body = [0x01u8, 0x2A, 0x00, 0x07, 0x12, 0x34];
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc::crc16(&body).to_le_bytes());
        let (_, flags) = ok_payload(parse_response(&frame, 1, 0x06, Some(&request[2..6])));
        assert!(flags.function_quirk);
    }

    #[test]
    fn test_decode_bits_lsb_first() {
        let payload = [0x01u8, 0x55];
        let bits = decode_bits(&payload, 8).unwrap();
        assert_eq!(bits, vec![true, false, true, false, true, false, true, false]);
    }

    #[test]
    fn test_decode_bits_ignores_trailing() {
        let payload = [0x02u8, 0xFF, 0x03];
        let bits = decode_bits(&payload, 10).unwrap();
        assert_eq!(bits.len(), 10);
        assert!(bits.iter().all(|&b| b));
    }

    #[test]
    fn test_decode_bits_short_payload() {
        assert!(decode_bits(&[0x02, 0xFF], 16).is_err());
        assert!(decode_bits(&[], 1).is_err());
    }

    #[test]
    fn test_decode_registers_big_endian() {
        let payload = [0x04u8, 0x12, 0x34, 0x56, 0x78];
        assert_eq!(decode_registers(&payload, 2).unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_decode_registers_count_mismatch() {
        let payload = [0x04u8, 0x12, 0x34, 0x56, 0x78];
        assert!(decode_registers(&payload, 3).is_err());
    }
}
