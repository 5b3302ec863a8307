//! RTU client facade
//!
//! Typed read/write operations over one serial port, device-state
//! bookkeeping for every exchange, connection diagnostics and the
//! register-0x2000 baudrate-switch protocol. All I/O funnels through the
//! transport engine behind one mutex, so operations on a client execute in
//! strict FIFO order.

use super::device_state::{registry, BitKind, DeviceState, RegisterKind};
use super::engine::{RtuResponse, RtuTransport, DEFAULT_MAX_ATTEMPTS, DEFAULT_RS485_MIN_GAP};
use super::error::RtuError;
use super::protocol::frame;
use super::protocol::FunctionCode;
use super::transport::{SerialLink, SerialPortLink};
use crate::config::LinkSettings;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Most coils/discrete inputs in one read
pub const MAX_READ_BITS: u16 = 2000;
/// Most coils in one multiple-write
pub const MAX_WRITE_BITS: u16 = 1968;
/// Most registers in one read
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most registers in one multiple-write
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Holding register Waveshare modules reconfigure their UART through
const BAUDRATE_REGISTER: u16 = 0x2000;

/// Wait for the device to reboot its UART after a baudrate write
const BAUDRATE_REBOOT_DELAY: Duration = Duration::from_secs(1);

/// Verification attempts before reverting a baudrate switch
const BAUDRATE_VERIFY_ATTEMPTS: u32 = 3;

/// Unit probed to verify a broadcast baudrate switch
const BAUDRATE_VERIFY_UNIT: u8 = 1;

/// Connection parameters for one client instance
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Serial port path
    pub port: String,
    /// Initial baudrate
    pub baudrate: u32,
    /// Per-attempt response timeout
    pub timeout: Duration,
    /// Minimum gap between exchanges on the bus
    pub rs485_min_gap: Duration,
    /// Attempts per operation
    pub max_attempts: u32,
    /// Baudrates the baudrate-switch protocol may target
    pub baudrates: Vec<u32>,
    /// Device register codes for register 0x2000, by baudrate
    pub baudrate_codes: BTreeMap<u32, u16>,
}

impl ClientConfig {
    /// Create a configuration with library defaults for everything but the port
    pub fn new(port: &str, baudrate: u32) -> Self {
        let defaults = LinkSettings::default();
        Self {
            port: port.to_string(),
            baudrate,
            timeout: defaults.timeout(),
            rs485_min_gap: DEFAULT_RS485_MIN_GAP,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            baudrates: defaults.baudrates,
            baudrate_codes: defaults.baudrate_codes,
        }
    }

    /// Create a configuration from loaded settings
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self {
            port: settings.default_port.clone(),
            baudrate: settings.default_baudrate,
            timeout: settings.timeout(),
            rs485_min_gap: settings.rs485_min_gap(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            baudrates: settings.baudrates.clone(),
            baudrate_codes: settings.baudrate_codes.clone(),
        }
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the RS-485 inter-exchange gap
    #[must_use]
    pub fn rs485_min_gap(mut self, gap: Duration) -> Self {
        self.rs485_min_gap = gap;
        self
    }

    /// Set the attempts per operation
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&LinkSettings::default())
    }
}

/// Modbus RTU client over one serial port
///
/// Construction performs no I/O; [`connect`](Self::connect) opens the port
/// and [`disconnect`](Self::disconnect) releases it. The port is closed
/// when the client drops.
pub struct RtuClient {
    config: ClientConfig,
    transport: Mutex<RtuTransport>,
}

impl RtuClient {
    /// Create a client over a real serial port
    pub fn new(config: ClientConfig) -> Self {
        let link = SerialPortLink::new(&config.port, config.baudrate);
        Self::with_link(config, Box::new(link))
    }

    /// Create a client over any serial link, e.g. a scripted mock
    pub fn with_link(config: ClientConfig, link: Box<dyn SerialLink>) -> Self {
        let transport = RtuTransport::new(link, config.timeout, config.rs485_min_gap, config.max_attempts);
        Self {
            config,
            transport: Mutex::new(transport),
        }
    }

    /// Open the serial port
    pub fn connect(&self) -> Result<(), RtuError> {
        self.transport.lock().connect()?;
        Ok(())
    }

    /// Close the serial port
    pub fn disconnect(&self) {
        self.transport.lock().disconnect();
    }

    /// Check whether the port is open
    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_connected()
    }

    /// Port path this client talks through
    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Baudrate currently in effect (may differ from the configured one
    /// after a successful switch)
    pub fn baudrate(&self) -> u32 {
        self.transport.lock().baudrate()
    }

    // ============ Read operations ============

    /// Read `count` coils starting at `address` (FC 0x01)
    pub fn read_coils(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>, RtuError> {
        self.read_bits(unit_id, FunctionCode::ReadCoils, BitKind::Coil, address, count)
    }

    /// Read `count` discrete inputs starting at `address` (FC 0x02)
    pub fn read_discrete_inputs(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>, RtuError> {
        self.read_bits(
            unit_id,
            FunctionCode::ReadDiscreteInputs,
            BitKind::DiscreteInput,
            address,
            count,
        )
    }

    /// Read `count` holding registers starting at `address` (FC 0x03)
    pub fn read_holding_registers(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, RtuError> {
        self.read_registers(
            unit_id,
            FunctionCode::ReadHoldingRegisters,
            RegisterKind::Holding,
            address,
            count,
        )
    }

    /// Read `count` input registers starting at `address` (FC 0x04)
    pub fn read_input_registers(&self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>, RtuError> {
        self.read_registers(
            unit_id,
            FunctionCode::ReadInputRegisters,
            RegisterKind::Input,
            address,
            count,
        )
    }

    fn read_bits(
        &self,
        unit_id: u8,
        function: FunctionCode,
        kind: BitKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, RtuError> {
        validate_count(count, MAX_READ_BITS, "bit read")?;
        let request = frame::read_request(unit_id, function, address, count);
        let response = self.exchange(unit_id, function as u8, &request)?;
        let bits = frame::decode_bits(&response.payload, count)
            .map_err(|reason| RtuError::ProtocolMismatch(reason.to_string()))?;
        self.device(unit_id).lock().set_bit_region(kind, address, &bits);
        Ok(bits)
    }

    fn read_registers(
        &self,
        unit_id: u8,
        function: FunctionCode,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, RtuError> {
        validate_count(count, MAX_READ_REGISTERS, "register read")?;
        let request = frame::read_request(unit_id, function, address, count);
        let response = self.exchange(unit_id, function as u8, &request)?;
        let values = frame::decode_registers(&response.payload, count)
            .map_err(|reason| RtuError::ProtocolMismatch(reason.to_string()))?;
        self.device(unit_id)
            .lock()
            .set_register_region(kind, address, &values);
        Ok(values)
    }

    // ============ Write operations ============

    /// Write one coil (FC 0x05)
    pub fn write_single_coil(&self, unit_id: u8, address: u16, value: bool) -> Result<(), RtuError> {
        let request = frame::write_single_coil_request(unit_id, address, value);
        let response = self.exchange(unit_id, FunctionCode::WriteSingleCoil as u8, &request)?;
        verify_write_echo(&request, &response)?;
        self.device(unit_id).lock().set_coil(address, value);
        Ok(())
    }

    /// Write one holding register (FC 0x06)
    pub fn write_single_register(&self, unit_id: u8, address: u16, value: u16) -> Result<(), RtuError> {
        let request = frame::write_single_register_request(unit_id, address, value);
        let response = self.exchange(unit_id, FunctionCode::WriteSingleRegister as u8, &request)?;
        verify_write_echo(&request, &response)?;
        self.device(unit_id)
            .lock()
            .set_register_region(RegisterKind::Holding, address, &[value]);
        Ok(())
    }

    /// Write a run of coils (FC 0x0F)
    pub fn write_multiple_coils(&self, unit_id: u8, address: u16, values: &[bool]) -> Result<(), RtuError> {
        validate_count(values.len() as u16, MAX_WRITE_BITS, "coil write")?;
        let request = frame::write_multiple_coils_request(unit_id, address, values);
        let response = self.exchange(unit_id, FunctionCode::WriteMultipleCoils as u8, &request)?;
        verify_write_echo(&request, &response)?;
        self.device(unit_id)
            .lock()
            .set_bit_region(BitKind::Coil, address, values);
        Ok(())
    }

    /// Write a run of holding registers (FC 0x10)
    pub fn write_multiple_registers(&self, unit_id: u8, address: u16, values: &[u16]) -> Result<(), RtuError> {
        validate_count(values.len() as u16, MAX_WRITE_REGISTERS, "register write")?;
        let request = frame::write_multiple_registers_request(unit_id, address, values);
        let response = self.exchange(unit_id, FunctionCode::WriteMultipleRegisters as u8, &request)?;
        verify_write_echo(&request, &response)?;
        self.device(unit_id)
            .lock()
            .set_register_region(RegisterKind::Holding, address, values);
        Ok(())
    }

    // ============ Diagnostics ============

    /// Probe the device and return `(reachable, diagnostics)`
    ///
    /// Tries a holding-register read first, then falls back to coils; the
    /// map carries `port`, `baudrate`, `unit_id`, `connected`, `test_read`
    /// and an `error` description on failure.
    pub fn test_connection(&self, unit_id: u8) -> (bool, Map<String, Value>) {
        let mut report = Map::new();
        report.insert("port".to_string(), json!(self.config.port));
        report.insert("baudrate".to_string(), json!(self.baudrate()));
        report.insert("unit_id".to_string(), json!(unit_id));
        report.insert("connected".to_string(), json!(false));
        report.insert("test_read".to_string(), json!(false));

        if !self.is_connected() {
            if let Err(error) = self.connect() {
                report.insert("error".to_string(), json!(error.to_string()));
                return (false, report);
            }
        }
        report.insert("connected".to_string(), json!(true));

        match self.read_holding_registers(unit_id, 0, 1) {
            Ok(values) => {
                report.insert("test_read".to_string(), json!(true));
                report.insert("register_0".to_string(), json!(values[0]));
                (true, report)
            }
            Err(register_error) => match self.read_coils(unit_id, 0, 1) {
                Ok(values) => {
                    report.insert("test_read".to_string(), json!(true));
                    report.insert("coil_0".to_string(), json!(values[0]));
                    (true, report)
                }
                Err(coil_error) => {
                    debug!(%register_error, "register probe failed before coil probe");
                    report.insert("error".to_string(), json!(coil_error.to_string()));
                    (false, report)
                }
            },
        }
    }

    // ============ Baudrate switching ============

    /// Tell the device to change its UART baudrate (register 0x2000)
    ///
    /// Device-side only; the local port keeps its rate. Unit 0 broadcasts,
    /// expects no reply and is considered delivered after the reboot
    /// delay. For addressed units a timed-out or CRC-damaged reply still
    /// counts as delivered, because the UART reconfigures before answering
    /// cleanly.
    pub fn set_device_baudrate(&self, unit_id: u8, target_baudrate: u32) -> Result<(), RtuError> {
        let code = self.baudrate_code(target_baudrate)?;
        info!(unit_id, target_baudrate, code, "requesting device baudrate change");

        if unit_id == 0 {
            let request = frame::write_single_register_request(0, BAUDRATE_REGISTER, code);
            self.transport.lock().broadcast(&request)?;
        } else {
            match self.write_single_register(unit_id, BAUDRATE_REGISTER, code) {
                Ok(()) => {}
                Err(RtuError::Timeout | RtuError::Crc) => {
                    debug!(unit_id, "no clean reply to baudrate write, assuming the UART is rebooting");
                }
                Err(error) => return Err(error),
            }
        }
        thread::sleep(BAUDRATE_REBOOT_DELAY);
        Ok(())
    }

    /// Switch device and client to `target_baudrate`, verifying and
    /// reverting on failure
    ///
    /// Sequence: write the baudrate code, wait for the UART reboot, reopen
    /// the local port at the new rate, verify with
    /// [`test_connection`](Self::test_connection) up to three times, and
    /// fall back to the prior rate if the device never answers. Must not
    /// be interleaved with other operations on this client: the serial
    /// handle is invalid while the port reopens.
    pub fn switch_baudrate(&self, target_baudrate: u32, unit_id: u8) -> Result<(), RtuError> {
        let prior = self.baudrate();
        if target_baudrate == prior {
            debug!(target_baudrate, "already at the requested baudrate");
            return Ok(());
        }

        self.set_device_baudrate(unit_id, target_baudrate)?;
        self.transport.lock().reconfigure_baudrate(target_baudrate)?;

        let verify_unit = if unit_id == 0 { BAUDRATE_VERIFY_UNIT } else { unit_id };
        for attempt in 1..=BAUDRATE_VERIFY_ATTEMPTS {
            let (ok, _) = self.test_connection(verify_unit);
            if ok {
                info!(target_baudrate, "baudrate switch verified");
                return Ok(());
            }
            warn!(attempt, target_baudrate, "baudrate verification failed");
        }

        let reason = match self.transport.lock().reconfigure_baudrate(prior) {
            Ok(()) => format!("device did not answer at {target_baudrate}, reverted to {prior}"),
            Err(error) => {
                format!("device did not answer at {target_baudrate} and revert to {prior} failed: {error}")
            }
        };
        Err(RtuError::BaudrateSwitch {
            target: target_baudrate,
            reason,
        })
    }

    // ============ Internals ============

    /// Run one exchange under the transport lock, keeping the device-state
    /// counters in step with the outcome
    fn exchange(&self, unit_id: u8, function: u8, request: &[u8]) -> Result<RtuResponse, RtuError> {
        let mut transport = self.transport.lock();
        let device = registry().get_or_create(transport.port(), unit_id, transport.baudrate());
        device.lock().record_request();

        let result = transport.execute(request, unit_id, function);
        drop(transport);

        {
            let mut state = device.lock();
            match &result {
                Ok(response) => {
                    if response.flags.crc_scheme.is_some() {
                        state.record_crc_quirk();
                    }
                    state.record_success();
                }
                Err(RtuError::Timeout) => state.record_timeout(),
                Err(RtuError::Crc) => state.record_crc_error(),
                Err(RtuError::Exception { .. }) => state.record_exception(),
                Err(RtuError::Io(_)) => state.record_io_error(),
                Err(_) => {}
            }
        }
        result
    }

    /// Registry entry for `unit_id` on this client's port
    fn device(&self, unit_id: u8) -> Arc<Mutex<DeviceState>> {
        let transport = self.transport.lock();
        registry().get_or_create(transport.port(), unit_id, transport.baudrate())
    }

    fn baudrate_code(&self, baudrate: u32) -> Result<u16, RtuError> {
        if !self.config.baudrates.contains(&baudrate) {
            return Err(RtuError::Validation(format!(
                "baudrate {baudrate} is not in the configured table"
            )));
        }
        self.config.baudrate_codes.get(&baudrate).copied().ok_or_else(|| {
            RtuError::Validation(format!("no device register code for baudrate {baudrate}"))
        })
    }
}

impl Drop for RtuClient {
    fn drop(&mut self) {
        self.transport.lock().disconnect();
    }
}

fn validate_count(count: u16, max: u16, what: &str) -> Result<(), RtuError> {
    if count == 0 || count > max {
        return Err(RtuError::Validation(format!(
            "{what} count {count} outside 1..={max}"
        )));
    }
    Ok(())
}

/// Confirm a write response echoes the request body
fn verify_write_echo(request: &[u8], response: &RtuResponse) -> Result<(), RtuError> {
    if response.payload.len() < 4 || response.payload[..4] != request[2..6] {
        return Err(RtuError::ProtocolMismatch(format!(
            "write echo mismatch: sent {}, device answered {}",
            hex::encode(&request[2..6]),
            hex::encode(&response.payload)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::frame::build_frame;
    use crate::core::transport::MockLink;

    fn test_config(port: &str) -> ClientConfig {
        ClientConfig::new(port, 9600)
            .timeout(Duration::from_millis(200))
            .rs485_min_gap(Duration::from_millis(0))
    }

    fn mock_client(port: &str) -> (RtuClient, MockLink) {
        let link = MockLink::new(port, 9600);
        let client = RtuClient::with_link(test_config(port), Box::new(link.clone()));
        client.connect().unwrap();
        (client, link)
    }

    #[test]
    fn test_count_validation_is_synchronous() {
        let (client, link) = mock_client("mock-validate");

        assert!(matches!(client.read_coils(1, 0, 0), Err(RtuError::Validation(_))));
        assert!(matches!(client.read_coils(1, 0, 2001), Err(RtuError::Validation(_))));
        assert!(matches!(
            client.read_holding_registers(1, 0, 126),
            Err(RtuError::Validation(_))
        ));
        assert!(matches!(
            client.write_multiple_coils(1, 0, &vec![true; 1969]),
            Err(RtuError::Validation(_))
        ));
        assert!(matches!(
            client.write_multiple_registers(1, 0, &vec![0u16; 124]),
            Err(RtuError::Validation(_))
        ));
        // no frame ever reached the wire
        assert!(link.written().is_empty());
    }

    #[test]
    fn test_read_registers_updates_state() {
        let (client, link) = mock_client("mock-read-regs");
        let request = frame::read_request(1, FunctionCode::ReadHoldingRegisters, 7, 1);
        link.script(&request, &build_frame(1, 0x03, &[0x02, 0x12, 0x34]));

        let values = client.read_holding_registers(1, 7, 1).unwrap();
        assert_eq!(values, vec![0x1234]);

        let device = registry().get("mock-read-regs", 1).unwrap();
        let state = device.lock();
        assert_eq!(state.holding_registers.get(&7), Some(&0x1234));
        assert_eq!(state.counters.requests, 1);
        assert_eq!(state.counters.successes, 1);
    }

    #[test]
    fn test_write_then_read_state_agrees() {
        let (client, link) = mock_client("mock-write-read");
        let write = frame::write_single_register_request(1, 7, 0x1234);
        link.script(&write, &write);
        let read = frame::read_request(1, FunctionCode::ReadHoldingRegisters, 7, 1);
        link.script(&read, &build_frame(1, 0x03, &[0x02, 0x12, 0x34]));

        client.write_single_register(1, 7, 0x1234).unwrap();
        assert_eq!(client.read_holding_registers(1, 7, 1).unwrap(), vec![0x1234]);

        let device = registry().get("mock-write-read", 1).unwrap();
        assert_eq!(device.lock().holding_registers.get(&7), Some(&0x1234));
    }

    #[test]
    fn test_write_echo_mismatch_is_protocol_error() {
        let (client, link) = mock_client("mock-bad-echo");
        let request = frame::write_single_coil_request(1, 3, true);
        // echo names the wrong address
        link.script(&request, &build_frame(1, 0x05, &[0x00, 0x04, 0xFF, 0x00]));

        assert!(matches!(
            client.write_single_coil(1, 3, true),
            Err(RtuError::ProtocolMismatch(_))
        ));
        let device = registry().get("mock-bad-echo", 1).unwrap();
        assert_eq!(device.lock().coils.get(&3), None);
    }

    #[test]
    fn test_test_connection_falls_back_to_coils() {
        let (client, link) = mock_client("mock-fallback");
        let register_probe = frame::read_request(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        link.script(&register_probe, &build_frame(1, 0x83, &[0x01]));
        let coil_probe = frame::read_request(1, FunctionCode::ReadCoils, 0, 1);
        link.script(&coil_probe, &build_frame(1, 0x01, &[0x01, 0x01]));

        let (ok, report) = client.test_connection(1);
        assert!(ok);
        assert_eq!(report.get("test_read"), Some(&json!(true)));
        assert_eq!(report.get("coil_0"), Some(&json!(true)));
    }

    #[test]
    fn test_test_connection_reports_failure() {
        let (client, _link) = mock_client("mock-dead");
        let (ok, report) = client.test_connection(1);
        assert!(!ok);
        assert_eq!(report.get("connected"), Some(&json!(true)));
        assert_eq!(report.get("test_read"), Some(&json!(false)));
        assert!(report.contains_key("error"));
    }

    #[test]
    fn test_switch_baudrate_rejects_unknown_rate() {
        let (client, link) = mock_client("mock-bad-baud");
        assert!(matches!(
            client.switch_baudrate(1200, 1),
            Err(RtuError::Validation(_))
        ));
        assert!(link.written().is_empty());
    }
}
