//! Device discovery
//!
//! Sweeps ports, baudrates and unit IDs with a ladder of cheap probe
//! reads, identifies Waveshare module variants, and can opportunistically
//! move a found device to the highest prioritized baudrate. Discovery
//! never returns an error: an unreachable combination is simply skipped.

use super::client::{ClientConfig, RtuClient};
use super::device_state::{registry, DeviceVariant};
use crate::config::LinkSettings;
use crate::core::transport::available_ports;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Waveshare software-version register on analog-input modules
const ANALOG_VERSION_REGISTER: u16 = 0x0101;

/// Waveshare channel-state register on 8-channel I/O modules
const IO_CHANNEL_STATE_REGISTER: u16 = 0x00FF;

/// A working `(port, baudrate, unit_id)` combination
///
/// Only produced after at least one probe read succeeded under the triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port path
    pub port: String,
    /// Baudrate the device answered at
    pub baudrate: u32,
    /// Responding unit ID
    pub unit_id: u8,
}

/// Knobs for a discovery sweep; unset lists fall back to the settings
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Explicit ports to probe instead of the configured/enumerated set
    pub ports: Option<Vec<String>>,
    /// Explicit baudrates in priority order
    pub baudrates: Option<Vec<u32>>,
    /// Explicit unit IDs
    pub unit_ids: Option<Vec<u8>>,
    /// Probe the found device for its Waveshare variant
    pub identify: bool,
    /// Try to move the found device to the highest prioritized baudrate
    pub upgrade_baudrate: bool,
}

/// Find the first responding device
///
/// For each port (preferring `/dev/ttyACM0` when present), each baudrate
/// in priority order and each unit ID, tries read_coils,
/// read_discrete_inputs, read_holding_registers and read_input_registers
/// at address 0; the first success wins.
pub fn autodetect(settings: &LinkSettings, options: &DiscoveryOptions) -> Option<DeviceConfig> {
    let ports = candidate_ports(settings, options);
    let baudrates = candidate_baudrates(settings, options);
    let unit_ids = candidate_unit_ids(settings, options);
    info!(?ports, ?baudrates, ?unit_ids, "starting device autodetection");

    for port in &ports {
        for &baudrate in &baudrates {
            debug!(port, baudrate, "probing");
            let client = RtuClient::new(probe_config(settings, port, baudrate));
            if client.connect().is_err() {
                debug!(port, baudrate, "port did not open");
                break;
            }
            for &unit_id in &unit_ids {
                if !probe_unit(&client, unit_id) {
                    continue;
                }
                info!(port, baudrate, unit_id, "found responding device");
                let mut found = DeviceConfig {
                    port: port.clone(),
                    baudrate,
                    unit_id,
                };
                if options.identify {
                    identify_variant(&client, unit_id);
                }
                if options.upgrade_baudrate {
                    maybe_upgrade_baudrate(settings, &client, unit_id, &mut found);
                }
                return Some(found);
            }
        }
    }
    warn!("no responding device on any port/baudrate/unit combination");
    None
}

/// Find every responding device
///
/// Like [`autodetect`] but collects all responding unit IDs; for each port
/// the first baudrate that yields any device is kept, matching a bus where
/// all modules share one rate.
pub fn scan_devices(settings: &LinkSettings, options: &DiscoveryOptions) -> Vec<DeviceConfig> {
    let ports = candidate_ports(settings, options);
    let baudrates = candidate_baudrates(settings, options);
    let unit_ids = candidate_unit_ids(settings, options);

    let mut found = Vec::new();
    for port in &ports {
        'baudrates: for &baudrate in &baudrates {
            let client = RtuClient::new(probe_config(settings, port, baudrate));
            if client.connect().is_err() {
                break;
            }
            let before = found.len();
            for &unit_id in &unit_ids {
                if probe_unit(&client, unit_id) {
                    info!(port, baudrate, unit_id, "found responding device");
                    if options.identify {
                        identify_variant(&client, unit_id);
                    }
                    found.push(DeviceConfig {
                        port: port.clone(),
                        baudrate,
                        unit_id,
                    });
                }
            }
            if found.len() > before {
                break 'baudrates;
            }
        }
    }
    info!(count = found.len(), "device scan finished");
    found
}

/// Try the four read functions at address 0 until one answers
pub(crate) fn probe_unit(client: &RtuClient, unit_id: u8) -> bool {
    client.read_coils(unit_id, 0, 1).is_ok()
        || client.read_discrete_inputs(unit_id, 0, 1).is_ok()
        || client.read_holding_registers(unit_id, 0, 1).is_ok()
        || client.read_input_registers(unit_id, 0, 1).is_ok()
}

/// Tag the device's Waveshare variant on its registry entry
///
/// 8-channel I/O modules answer a coil block read and expose channel state
/// at 0x00FF; analog-input modules answer an input-register block read and
/// expose their software version at 0x0101.
fn identify_variant(client: &RtuClient, unit_id: u8) -> Option<DeviceVariant> {
    let variant = if client.read_coils(unit_id, 0, 8).is_ok() {
        match client.read_holding_registers(unit_id, IO_CHANNEL_STATE_REGISTER, 1) {
            Ok(values) => debug!(unit_id, state = values[0], "channel-state register answered"),
            Err(error) => debug!(unit_id, %error, "channel-state register not readable"),
        }
        Some(DeviceVariant::Io8ch)
    } else if client.read_input_registers(unit_id, 0, 8).is_ok() {
        match client.read_holding_registers(unit_id, ANALOG_VERSION_REGISTER, 1) {
            Ok(values) => info!(unit_id, version = values[0], "analog module software version"),
            Err(error) => debug!(unit_id, %error, "software-version register not readable"),
        }
        Some(DeviceVariant::AnalogInput8ch)
    } else {
        None
    };

    if let Some(variant) = variant {
        info!(unit_id, ?variant, "identified module variant");
        registry()
            .get_or_create(client.port(), unit_id, client.baudrate())
            .lock()
            .variant = Some(variant);
    }
    variant
}

/// After detection at a slow rate, try one switch to the preferred rate
fn maybe_upgrade_baudrate(
    settings: &LinkSettings,
    client: &RtuClient,
    unit_id: u8,
    found: &mut DeviceConfig,
) {
    let preferred = settings.highest_prioritized_baudrate();
    if found.baudrate >= preferred {
        return;
    }
    match client.switch_baudrate(preferred, unit_id) {
        Ok(()) => {
            info!(from = found.baudrate, to = preferred, "upgraded device baudrate");
            found.baudrate = preferred;
        }
        Err(error) => {
            warn!(%error, "baudrate upgrade failed, staying at the detected rate");
        }
    }
}

fn probe_config(settings: &LinkSettings, port: &str, baudrate: u32) -> ClientConfig {
    let mut config = ClientConfig::from_settings(settings);
    config.port = port.to_string();
    config.baudrate = baudrate;
    config
}

fn candidate_ports(settings: &LinkSettings, options: &DiscoveryOptions) -> Vec<String> {
    let mut ports = options.ports.clone().unwrap_or_else(|| {
        let mut configured = settings.auto_detect.ports.clone();
        for port in available_ports() {
            if !configured.contains(&port) {
                configured.push(port);
            }
        }
        configured
    });
    // USB CDC adapters usually enumerate here first
    if let Some(index) = ports.iter().position(|p| p == "/dev/ttyACM0") {
        ports.swap(0, index);
    }
    ports
}

fn candidate_baudrates(settings: &LinkSettings, options: &DiscoveryOptions) -> Vec<u32> {
    options
        .baudrates
        .clone()
        .unwrap_or_else(|| settings.prioritized_baudrates.clone())
}

fn candidate_unit_ids(settings: &LinkSettings, options: &DiscoveryOptions) -> Vec<u8> {
    options
        .unit_ids
        .clone()
        .unwrap_or_else(|| settings.auto_detect.unit_ids.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::frame::{build_frame, read_request};
    use crate::core::protocol::FunctionCode;
    use crate::core::transport::MockLink;
    use std::time::Duration;

    fn mock_client(port: &str) -> (RtuClient, MockLink) {
        let link = MockLink::new(port, 9600);
        let config = ClientConfig::new(port, 9600)
            .timeout(Duration::from_millis(150))
            .rs485_min_gap(Duration::from_millis(0))
            .max_attempts(1);
        let client = RtuClient::with_link(config, Box::new(link.clone()));
        client.connect().unwrap();
        (client, link)
    }

    #[test]
    fn test_probe_ladder_reaches_input_registers() {
        let (client, link) = mock_client("mock-probe-ladder");
        // only the last rung answers
        let request = read_request(1, FunctionCode::ReadInputRegisters, 0, 1);
        link.script(&request, &build_frame(1, 0x04, &[0x02, 0x00, 0x2A]));

        assert!(probe_unit(&client, 1));
        // all four rungs were attempted in order
        assert_eq!(link.written().len(), 4);
    }

    #[test]
    fn test_probe_fails_when_nothing_answers() {
        let (client, _link) = mock_client("mock-probe-dead");
        assert!(!probe_unit(&client, 1));
    }

    #[test]
    fn test_identify_io_module() {
        let (client, link) = mock_client("mock-identify-io");
        let coil_block = read_request(1, FunctionCode::ReadCoils, 0, 8);
        link.script(&coil_block, &build_frame(1, 0x01, &[0x01, 0x55]));
        let channel_state = read_request(1, FunctionCode::ReadHoldingRegisters, IO_CHANNEL_STATE_REGISTER, 1);
        link.script(&channel_state, &build_frame(1, 0x03, &[0x02, 0x00, 0x55]));

        assert_eq!(identify_variant(&client, 1), Some(DeviceVariant::Io8ch));
        let device = registry().get("mock-identify-io", 1).unwrap();
        assert_eq!(device.lock().variant, Some(DeviceVariant::Io8ch));
    }

    #[test]
    fn test_autodetect_skips_unopenable_ports() {
        let settings = LinkSettings::default();
        let options = DiscoveryOptions {
            ports: Some(vec!["/definitely/not/a/port".to_string()]),
            baudrates: Some(vec![9600]),
            unit_ids: Some(vec![1]),
            ..DiscoveryOptions::default()
        };
        assert_eq!(autodetect(&settings, &options), None);
    }

    #[test]
    fn test_candidate_ports_prefers_acm0() {
        let settings = LinkSettings::default();
        let options = DiscoveryOptions {
            ports: Some(vec![
                "/dev/ttyUSB0".to_string(),
                "/dev/ttyACM0".to_string(),
            ]),
            ..DiscoveryOptions::default()
        };
        let ports = candidate_ports(&settings, &options);
        assert_eq!(ports[0], "/dev/ttyACM0");
    }
}
