//! Link settings: defaults, JSON file, environment overrides
//!
//! Loaded once at startup into an immutable struct; precedence is
//! environment > file > built-in defaults. The hot path never touches the
//! filesystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Settings load/save failures
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Discovery sweep defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDetectSettings {
    /// Ports probed when none are given explicitly
    pub ports: Vec<String>,
    /// Unit IDs probed on each port/baudrate combination
    pub unit_ids: Vec<u8>,
}

impl Default for AutoDetectSettings {
    fn default() -> Self {
        Self {
            ports: vec![
                "/dev/ttyACM0".to_string(),
                "/dev/ttyUSB0".to_string(),
                "/dev/ttyS0".to_string(),
            ],
            unit_ids: vec![1, 2, 3, 4, 5],
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Port used when the caller does not name one
    pub default_port: String,
    /// Baudrate used when the caller does not name one
    pub default_baudrate: u32,
    /// Per-attempt response timeout in seconds
    pub default_timeout_seconds: f64,
    /// Unit ID assumed for single-device buses
    pub default_unit_id: u8,
    /// Canonical set of supported baudrates
    pub baudrates: Vec<u32>,
    /// Discovery order; first entry is the preferred (highest) rate
    pub prioritized_baudrates: Vec<u32>,
    /// Discovery sweep defaults
    pub auto_detect: AutoDetectSettings,
    /// Device register codes written to 0x2000 to change a module's baudrate
    pub baudrate_codes: BTreeMap<u32, u16>,
    /// Minimum wall-clock gap between two exchanges on one bus, in seconds
    pub rs485_min_gap_seconds: f64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            default_port: "/dev/ttyACM0".to_string(),
            default_baudrate: 9600,
            default_timeout_seconds: 1.0,
            default_unit_id: 1,
            baudrates: vec![4800, 9600, 19200, 38400, 57600, 115200],
            prioritized_baudrates: vec![115200, 57600, 38400, 19200, 9600],
            auto_detect: AutoDetectSettings::default(),
            baudrate_codes: BTreeMap::from([
                (4800, 0),
                (9600, 1),
                (19200, 2),
                (38400, 3),
                (57600, 4),
                (115200, 5),
            ]),
            rs485_min_gap_seconds: 0.05,
        }
    }
}

impl LinkSettings {
    /// Load settings from the default location with environment overrides
    ///
    /// Missing or unreadable files fall back to the built-in defaults; the
    /// environment always has the last word.
    pub fn load() -> Self {
        let mut settings = config_file_path()
            .and_then(|path| match Self::load_from(&path) {
                Ok(loaded) => {
                    debug!(path = %path.display(), "loaded settings file");
                    Some(loaded)
                }
                Err(SettingsError::Io(_)) => None,
                Err(error) => {
                    warn!(path = %path.display(), %error, "ignoring malformed settings file");
                    None
                }
            })
            .unwrap_or_default();
        settings.apply_env();
        settings
    }

    /// Load settings from a specific JSON file, without environment overrides
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save settings to a JSON file
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `MODLINK_*` environment variable overrides
    pub fn apply_env(&mut self) {
        if let Some(port) = env_var("MODLINK_PORT") {
            self.default_port = port;
        }
        if let Some(baudrate) = parse_env("MODLINK_BAUDRATE") {
            self.default_baudrate = baudrate;
        }
        if let Some(timeout) = parse_env("MODLINK_TIMEOUT") {
            self.default_timeout_seconds = timeout;
        }
        if let Some(unit_id) = parse_env("MODLINK_UNIT_ID") {
            self.default_unit_id = unit_id;
        }
        if let Some(gap) = parse_env("MODLINK_RS485_MIN_GAP") {
            self.rs485_min_gap_seconds = gap;
        }
    }

    /// Per-attempt timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_seconds.max(0.0))
    }

    /// RS-485 inter-exchange gap as a [`Duration`]
    pub fn rs485_min_gap(&self) -> Duration {
        Duration::from_secs_f64(self.rs485_min_gap_seconds.max(0.0))
    }

    /// Preferred baudrate, the head of the prioritized list
    pub fn highest_prioritized_baudrate(&self) -> u32 {
        self.prioritized_baudrates
            .first()
            .copied()
            .unwrap_or(self.default_baudrate)
    }

    /// Device register code for `baudrate`, if the table knows it
    pub fn baudrate_code(&self, baudrate: u32) -> Option<u16> {
        self.baudrate_codes.get(&baudrate).copied()
    }
}

fn config_file_path() -> Option<std::path::PathBuf> {
    super::config_dir().map(|dir| dir.join("config.json"))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let settings = LinkSettings::default();
        assert_eq!(settings.highest_prioritized_baudrate(), 115200);
        assert!(settings
            .prioritized_baudrates
            .iter()
            .all(|b| settings.baudrates.contains(b)));
        assert!(settings
            .baudrates
            .iter()
            .all(|b| settings.baudrate_codes.contains_key(b)));
        assert_eq!(settings.rs485_min_gap(), Duration::from_millis(50));
        assert_eq!(settings.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut settings = LinkSettings::default();
        settings.default_port = "/dev/ttyUSB1".to_string();
        settings.default_baudrate = 115200;
        settings.save(&path).unwrap();

        let loaded = LinkSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_baudrate": 19200}"#).unwrap();

        let loaded = LinkSettings::load_from(&path).unwrap();
        assert_eq!(loaded.default_baudrate, 19200);
        assert_eq!(loaded.default_port, "/dev/ttyACM0");
        assert_eq!(loaded.baudrate_code(115200), Some(5));
    }

    #[test]
    fn test_env_overrides_win() {
        std::env::set_var("MODLINK_PORT", "/dev/ttyAMA0");
        std::env::set_var("MODLINK_BAUDRATE", "57600");
        std::env::set_var("MODLINK_TIMEOUT", "not-a-number");

        let mut settings = LinkSettings::default();
        settings.apply_env();
        assert_eq!(settings.default_port, "/dev/ttyAMA0");
        assert_eq!(settings.default_baudrate, 57600);
        // unparseable override is ignored, default survives
        assert_eq!(settings.default_timeout_seconds, 1.0);

        std::env::remove_var("MODLINK_PORT");
        std::env::remove_var("MODLINK_BAUDRATE");
        std::env::remove_var("MODLINK_TIMEOUT");
    }
}
