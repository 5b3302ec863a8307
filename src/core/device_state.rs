//! Per-device observed state and reliability counters
//!
//! Every `(port, unit_id)` pair the process has talked to gets one entry:
//! the last observed value of each coil/register address, counters for
//! every exchange outcome, and a last-seen timestamp. Entries live in a
//! process-wide registry and serialize to one JSON document per device for
//! diagnostics and replay.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Waveshare module variant identified during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceVariant {
    /// 8-channel relay/digital I/O module
    Io8ch,
    /// 8-channel analog input module
    AnalogInput8ch,
}

/// Which 16-bit register table an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Read/write holding registers
    Holding,
    /// Read-only input registers
    Input,
}

/// Which 1-bit table an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitKind {
    /// Read/write coils
    Coil,
    /// Read-only discrete inputs
    DiscreteInput,
}

/// Exchange outcome counters, incremented for every category so dumps
/// reflect link reliability accurately
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounters {
    /// Requests issued
    pub requests: u64,
    /// Fully or partially accepted responses
    pub successes: u64,
    /// Attempts that produced no parseable frame
    pub timeouts: u64,
    /// Frames rejected by every CRC scheme
    pub crc_errors: u64,
    /// Frames accepted via an alternative CRC interpretation
    pub crc_quirks: u64,
    /// Modbus exception responses
    pub exceptions: u64,
    /// Serial I/O failures
    pub io_errors: u64,
}

/// Last observed state of one field device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Slave address on the bus
    pub unit_id: u8,
    /// Serial port the device was seen on
    pub port: String,
    /// Baudrate in effect at last contact
    pub baudrate: u32,
    /// Last observed coil values by address
    pub coils: BTreeMap<u16, bool>,
    /// Last observed discrete input values by address
    pub discrete_inputs: BTreeMap<u16, bool>,
    /// Last observed holding register values by address
    pub holding_registers: BTreeMap<u16, u16>,
    /// Last observed input register values by address
    pub input_registers: BTreeMap<u16, u16>,
    /// Exchange outcome counters
    pub counters: DeviceCounters,
    /// Timestamp of the last successful contact
    pub last_seen: Option<DateTime<Utc>>,
    /// Module variant, when discovery identified one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<DeviceVariant>,
}

impl DeviceState {
    /// Create an empty state record
    pub fn new(port: &str, unit_id: u8, baudrate: u32) -> Self {
        Self {
            unit_id,
            port: port.to_string(),
            baudrate,
            coils: BTreeMap::new(),
            discrete_inputs: BTreeMap::new(),
            holding_registers: BTreeMap::new(),
            input_registers: BTreeMap::new(),
            counters: DeviceCounters::default(),
            last_seen: None,
            variant: None,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// Count a request going out
    pub fn record_request(&mut self) {
        self.counters.requests += 1;
    }

    /// Count an accepted response and refresh `last_seen`
    pub fn record_success(&mut self) {
        self.counters.successes += 1;
        self.touch();
    }

    /// Count an attempt that never produced a frame
    pub fn record_timeout(&mut self) {
        self.counters.timeouts += 1;
    }

    /// Count a frame rejected by every CRC scheme
    pub fn record_crc_error(&mut self) {
        self.counters.crc_errors += 1;
    }

    /// Count a frame accepted through an alternative CRC interpretation
    pub fn record_crc_quirk(&mut self) {
        self.counters.crc_quirks += 1;
    }

    /// Count a Modbus exception response
    pub fn record_exception(&mut self) {
        self.counters.exceptions += 1;
    }

    /// Count a serial I/O failure
    pub fn record_io_error(&mut self) {
        self.counters.io_errors += 1;
    }

    /// Store one observed coil value
    pub fn set_coil(&mut self, address: u16, value: bool) {
        self.coils.insert(address, value);
    }

    /// Store a run of observed bit values starting at `start`
    pub fn set_bit_region(&mut self, kind: BitKind, start: u16, values: &[bool]) {
        let table = match kind {
            BitKind::Coil => &mut self.coils,
            BitKind::DiscreteInput => &mut self.discrete_inputs,
        };
        for (offset, &value) in values.iter().enumerate() {
            table.insert(start.wrapping_add(offset as u16), value);
        }
    }

    /// Store a run of observed register values starting at `start`
    pub fn set_register_region(&mut self, kind: RegisterKind, start: u16, values: &[u16]) {
        let table = match kind {
            RegisterKind::Holding => &mut self.holding_registers,
            RegisterKind::Input => &mut self.input_registers,
        };
        for (offset, &value) in values.iter().enumerate() {
            table.insert(start.wrapping_add(offset as u16), value);
        }
    }
}

/// Persistence failures for state dumps
#[derive(Error, Debug)]
pub enum PersistError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No registry entry for the requested device
    #[error("Unknown device: {port} unit {unit_id}")]
    UnknownDevice {
        /// Requested port
        port: String,
        /// Requested unit ID
        unit_id: u8,
    },
}

/// Process-wide map of device states keyed by `(port, unit_id)`
///
/// Handles into entries are shared `Arc<Mutex<_>>`; callers look entries up
/// by key rather than holding long-lived references.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<(String, u8), Arc<Mutex<DeviceState>>>>,
}

impl DeviceRegistry {
    /// Fetch the entry for `(port, unit_id)`, creating it on first contact
    pub fn get_or_create(&self, port: &str, unit_id: u8, baudrate: u32) -> Arc<Mutex<DeviceState>> {
        if let Some(entry) = self.get(port, unit_id) {
            entry.lock().baudrate = baudrate;
            return entry;
        }
        let mut devices = self.devices.write();
        let entry = devices
            .entry((port.to_string(), unit_id))
            .or_insert_with(|| {
                debug!(port, unit_id, "tracking new device");
                Arc::new(Mutex::new(DeviceState::new(port, unit_id, baudrate)))
            });
        entry.clone()
    }

    /// Fetch an existing entry
    pub fn get(&self, port: &str, unit_id: u8) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices.read().get(&(port.to_string(), unit_id)).cloned()
    }

    /// Keys of every tracked device
    pub fn list(&self) -> Vec<(String, u8)> {
        let mut keys: Vec<_> = self.devices.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Dump one device to `directory`, returning the file written
    pub fn dump_one(&self, port: &str, unit_id: u8, directory: &Path) -> Result<PathBuf, PersistError> {
        let entry = self.get(port, unit_id).ok_or_else(|| PersistError::UnknownDevice {
            port: port.to_string(),
            unit_id,
        })?;
        fs::create_dir_all(directory)?;
        let path = directory.join(dump_file_name(port, unit_id));
        let json = serde_json::to_string_pretty(&*entry.lock())?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Dump every tracked device to `directory`
    pub fn dump_all(&self, directory: &Path) -> Result<Vec<PathBuf>, PersistError> {
        let mut written = Vec::new();
        for (port, unit_id) in self.list() {
            written.push(self.dump_one(&port, unit_id, directory)?);
        }
        Ok(written)
    }

    /// Read a previously dumped state document
    ///
    /// Diagnostics/replay only; the loaded state is not fed back into the
    /// transport.
    pub fn load_from(path: &Path) -> Result<DeviceState, PersistError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Drop every entry; used between test scenarios
    pub fn clear(&self) {
        self.devices.write().clear();
    }
}

fn dump_file_name(port: &str, unit_id: u8) -> String {
    let safe_port: String = port
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("device_{safe_port}_unit{unit_id}.json")
}

static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(DeviceRegistry::default);

/// The process-wide device registry
pub fn registry() -> &'static DeviceRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_updates() {
        let mut state = DeviceState::new("/dev/ttyACM0", 1, 9600);
        state.set_bit_region(BitKind::Coil, 4, &[true, false, true]);
        assert_eq!(state.coils.get(&4), Some(&true));
        assert_eq!(state.coils.get(&5), Some(&false));
        assert_eq!(state.coils.get(&6), Some(&true));

        state.set_register_region(RegisterKind::Holding, 7, &[0x1234, 0x5678]);
        assert_eq!(state.holding_registers.get(&7), Some(&0x1234));
        assert_eq!(state.holding_registers.get(&8), Some(&0x5678));
        assert!(state.input_registers.is_empty());
    }

    #[test]
    fn test_counters_and_last_seen() {
        let mut state = DeviceState::new("/dev/ttyACM0", 1, 9600);
        assert!(state.last_seen.is_none());
        state.record_request();
        state.record_success();
        state.record_timeout();
        state.record_crc_quirk();
        assert_eq!(state.counters.requests, 1);
        assert_eq!(state.counters.successes, 1);
        assert_eq!(state.counters.timeouts, 1);
        assert_eq!(state.counters.crc_quirks, 1);
        assert!(state.last_seen.is_some());
    }

    #[test]
    fn test_registry_returns_same_entry() {
        let registry = DeviceRegistry::default();
        let first = registry.get_or_create("/dev/ttyUSB0", 3, 9600);
        first.lock().set_coil(0, true);
        let second = registry.get_or_create("/dev/ttyUSB0", 3, 19200);
        assert_eq!(second.lock().coils.get(&0), Some(&true));
        assert_eq!(second.lock().baudrate, 19200);
        assert_eq!(registry.list(), vec![("/dev/ttyUSB0".to_string(), 3)]);
    }

    #[test]
    fn test_dump_and_load_roundtrip() {
        let registry = DeviceRegistry::default();
        let entry = registry.get_or_create("/dev/ttyACM0", 2, 115200);
        {
            let mut state = entry.lock();
            state.set_coil(0, true);
            state.set_register_region(RegisterKind::Input, 0, &[0x00FF]);
            state.record_request();
            state.record_success();
            state.variant = Some(DeviceVariant::Io8ch);
        }

        let dir = tempfile::tempdir().unwrap();
        let path = registry.dump_one("/dev/ttyACM0", 2, dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "device__dev_ttyACM0_unit2.json"
        );

        let loaded = DeviceRegistry::load_from(&path).unwrap();
        assert_eq!(loaded.unit_id, 2);
        assert_eq!(loaded.baudrate, 115200);
        assert_eq!(loaded.coils.get(&0), Some(&true));
        assert_eq!(loaded.input_registers.get(&0), Some(&0x00FF));
        assert_eq!(loaded.counters.successes, 1);
        assert_eq!(loaded.variant, Some(DeviceVariant::Io8ch));
    }

    #[test]
    fn test_dump_unknown_device_errors() {
        let registry = DeviceRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            registry.dump_one("/dev/null", 9, dir.path()),
            Err(PersistError::UnknownDevice { .. })
        ));
    }
}
