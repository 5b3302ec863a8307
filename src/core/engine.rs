//! Half-duplex transport engine
//!
//! Owns the serial link and serializes every exchange on it: RS-485
//! pacing, buffer flushes, adaptive response-length detection, the early
//! acceptance path for devices that stop transmitting short, and the retry
//! policy with timeout escalation. Each attempt produces a typed result;
//! the retry loop inspects it rather than catching anything.

use super::error::RtuError;
use super::protocol::frame::{self, InvalidReason, ParseOutcome, ResponseFlags};
use super::protocol::canonical;
use super::transport::{SerialLink, TransportError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default minimum wall-clock gap between two exchanges on one bus
pub const DEFAULT_RS485_MIN_GAP: Duration = Duration::from_millis(50);

/// Default number of attempts per operation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-attempt timeout growth factor between retries
pub const RETRY_TIMEOUT_GROWTH: f64 = 1.5;

/// Delay after flushing buffers, letting the line settle before transmit
const LINE_SETTLE: Duration = Duration::from_millis(50);

/// Receive-loop poll interval
const POLL_SLEEP: Duration = Duration::from_millis(5);

/// Idle period that counts as the device having stopped transmitting
const STALL_WINDOW: Duration = Duration::from_millis(10);

/// Shortest frame worth handing to the parser
const MIN_FRAME_LEN: usize = 4;

/// Smallest complete response (an exception frame), used for the settle formula
const MIN_RESPONSE_BYTES: usize = 5;

/// Fraction of the attempt timeout after which a stalled short frame is accepted
const QUIRK_ACCEPT_FRACTION: f64 = 0.7;

/// An accepted response: payload plus the tolerance rules that fired
#[derive(Debug, Clone)]
pub struct RtuResponse {
    /// Payload bytes between the frame header and the CRC
    pub payload: Vec<u8>,
    /// Qualifiers recorded during parsing
    pub flags: ResponseFlags,
}

/// Blocking half-duplex exchange engine over one serial link
pub struct RtuTransport {
    link: Box<dyn SerialLink>,
    timeout: Duration,
    min_gap: Duration,
    max_attempts: u32,
    last_exchange_end: Option<Instant>,
}

impl RtuTransport {
    /// Create an engine over `link`; no I/O happens until [`connect`](Self::connect)
    pub fn new(link: Box<dyn SerialLink>, timeout: Duration, min_gap: Duration, max_attempts: u32) -> Self {
        Self {
            link,
            timeout,
            min_gap,
            max_attempts: max_attempts.max(1),
            last_exchange_end: None,
        }
    }

    /// Open the serial link
    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.link.open()
    }

    /// Close the serial link
    pub fn disconnect(&mut self) {
        self.link.close();
    }

    /// Check if the link is open
    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Port path of the underlying link
    pub fn port(&self) -> &str {
        self.link.name()
    }

    /// Current baudrate of the underlying link
    pub fn baudrate(&self) -> u32 {
        self.link.baudrate()
    }

    /// Close the link, change its baudrate and reopen it
    ///
    /// Used by the baudrate-switch protocol; the handle is invalid between
    /// close and reopen, so nothing else may run against this engine.
    pub fn reconfigure_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        self.link.close();
        self.link.set_baudrate(baudrate)?;
        self.link.open()
    }

    /// Run a request/response exchange with retries
    ///
    /// Timeouts, CRC damage and I/O errors are retried with escalating
    /// per-attempt timeouts; exception responses and protocol mismatches
    /// short-circuit. The final outcome is the last attempt's result.
    pub fn execute(
        &mut self,
        request: &[u8],
        expected_unit: u8,
        expected_function: u8,
    ) -> Result<RtuResponse, RtuError> {
        let mut timeout = self.timeout;
        let mut attempt = 1u32;
        loop {
            match self.attempt(request, expected_unit, expected_function, timeout) {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    warn!(attempt, %error, "exchange failed, retrying");
                    if matches!(error, RtuError::Io(_)) {
                        self.link.close();
                        self.link.open()?;
                    }
                    thread::sleep(2 * self.min_gap);
                    timeout = timeout.mul_f64(RETRY_TIMEOUT_GROWTH);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Send a request that expects no response (broadcast writes)
    ///
    /// Considered successful once the bytes have drained; any late reply is
    /// swept up by the next exchange's input flush.
    pub fn broadcast(&mut self, request: &[u8]) -> Result<(), RtuError> {
        self.enforce_gap();
        self.link.flush_input()?;
        self.link.flush_output()?;
        thread::sleep(LINE_SETTLE);
        debug!(frame = %hex::encode(request), "broadcast");
        self.link.write_all(request)?;
        self.last_exchange_end = Some(Instant::now());
        Ok(())
    }

    /// One exchange attempt against one deadline
    fn attempt(
        &mut self,
        request: &[u8],
        expected_unit: u8,
        expected_function: u8,
        timeout: Duration,
    ) -> Result<RtuResponse, RtuError> {
        self.enforce_gap();

        self.link.flush_input()?;
        self.link.flush_output()?;
        thread::sleep(LINE_SETTLE);

        trace!(frame = %hex::encode(request), "tx");
        self.link.write_all(request)?;

        let settle = initial_settle(self.link.baudrate());
        let started = Instant::now();
        // a timeout shorter than the settle wait would never poll at all
        let deadline = started + timeout.max(settle + POLL_SLEEP);
        thread::sleep(settle);

        let mut buffer: Vec<u8> = Vec::new();
        let mut last_growth = Instant::now();
        loop {
            let read = match self.link.read_available(&mut buffer) {
                Ok(n) => n,
                Err(error) => {
                    self.last_exchange_end = Some(Instant::now());
                    return Err(error.into());
                }
            };
            if read > 0 {
                last_growth = Instant::now();
            }

            if let Some(expected) = expected_frame_len(&buffer) {
                if buffer.len() >= expected {
                    buffer.truncate(expected);
                    break;
                }
            }

            // Waveshare modules sometimes stop mid-frame; accept what we
            // have once most of the window is gone and the line went quiet
            if buffer.len() >= MIN_FRAME_LEN
                && started.elapsed() >= timeout.mul_f64(QUIRK_ACCEPT_FRACTION)
                && last_growth.elapsed() >= STALL_WINDOW
            {
                debug!(len = buffer.len(), "accepting stalled short response");
                break;
            }

            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_SLEEP);
        }

        self.last_exchange_end = Some(Instant::now());

        if buffer.len() < MIN_FRAME_LEN {
            warn!(port = self.link.name(), len = buffer.len(), "no usable response before deadline");
            return Err(RtuError::Timeout);
        }

        trace!(frame = %hex::encode(&buffer), "rx");
        let request_payload = &request[2..request.len() - 2];
        match frame::parse_response(&buffer, expected_unit, expected_function, Some(request_payload)) {
            ParseOutcome::Ok { payload, flags } => Ok(RtuResponse { payload, flags }),
            ParseOutcome::Exception { code, .. } => Err(RtuError::Exception { code }),
            ParseOutcome::Incomplete => Err(RtuError::Timeout),
            ParseOutcome::Invalid(InvalidReason::Crc) => Err(RtuError::Crc),
            ParseOutcome::Invalid(reason) => Err(RtuError::ProtocolMismatch(reason.describe().to_string())),
        }
    }

    /// Sleep until at least `min_gap` has passed since the previous exchange
    fn enforce_gap(&mut self) {
        if let Some(end) = self.last_exchange_end {
            let elapsed = end.elapsed();
            if elapsed < self.min_gap {
                thread::sleep(self.min_gap - elapsed);
            }
        }
    }
}

/// Settling wait after transmit: `max(100ms, 2 × transmission time of the
/// smallest complete response)`
fn initial_settle(baudrate: u32) -> Duration {
    let bits = (10 * MIN_RESPONSE_BYTES) as f64;
    let transmission = Duration::from_secs_f64(2.0 * bits / f64::from(baudrate.max(1)));
    transmission.max(Duration::from_millis(100))
}

/// Expected total frame length implied by the echoed function code, once
/// enough of the buffer has arrived to tell
fn expected_frame_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    let function_code = buffer[1];
    if function_code & 0x80 != 0 {
        return Some(5);
    }
    match canonical(function_code) {
        0x01..=0x04 => {
            if buffer.len() >= 3 {
                Some(3 + buffer[2] as usize + 2)
            } else {
                None
            }
        }
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        _ => None,
    }
}
