//! Configuration module
//!
//! Link settings (JSON file + environment overrides) and application
//! directory helpers.

mod settings;

pub use settings::{AutoDetectSettings, LinkSettings, SettingsError};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "modlink", "Modlink").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "modlink", "Modlink").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default directory for device-state dumps
pub fn state_dump_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("devices"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(dir) = state_dump_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
