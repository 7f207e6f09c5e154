//! Studio host configuration and its persistence.
//!
//! Stored as `studio.json` in the platform config directory
//! (e.g. `~/.config/studio-host/` on Linux). A missing or invalid file
//! loads as defaults; saving is an atomic temp-file rename.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Port the Studio server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 4983;

const CONFIG_FILE: &str = "studio.json";

/// Supervisor configuration. Changing it never moves the session by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server binary; `None` resolves `studio-server` on the search path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Open the studio surface automatically when the session begins
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_auto_start() -> bool {
    true
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            binary: None,
            auto_start: default_auto_start(),
        }
    }
}

/// Studio host config directory (e.g. `~/.config/studio-host/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("studio-host"))
}

/// Path of the config file, if the platform has a config directory.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}

/// Load config from disk, returning defaults if the file is missing or invalid.
pub fn load_config() -> StudioConfig {
    let Some(path) = config_path() else {
        return StudioConfig::default();
    };
    load_config_from(&path)
}

/// Save config to disk.
pub fn save_config(config: &StudioConfig) -> Result<(), std::io::Error> {
    let path = config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &path)
}

pub fn load_config_from(path: &Path) -> StudioConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => StudioConfig::default(),
    }
}

pub fn save_config_to(config: &StudioConfig, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
