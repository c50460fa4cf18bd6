//! Persistent configuration for vmatic.
//!
//! Stores user defaults in `~/.vmatic/config.json`: the QMP monitor address,
//! OCR training data, console geometry, and the recognizer binary. Command
//! line flags always override values from this file.
//!
//! # Example
//!
//! ```no_run
//! use vmatic_core::config::VmaticConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = VmaticConfig::load();
//!
//! if let Some(socket) = &config.monitor {
//!     println!("default monitor: {socket}");
//! }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// The vmatic home directory, `~/.vmatic`.
pub fn vmatic_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vmatic")
}

/// Directory for transient screenshot files taken by the watch loop.
pub fn shot_dir() -> PathBuf {
    let dir = vmatic_dir().join("shots");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Persistent vmatic configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmaticConfig {
    /// Default QMP monitor address (socket path or `host:port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<String>,

    /// Default OCR training data path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_data: Option<PathBuf>,

    /// Default recognizer binary for [`CommandOcr`](crate::ocr::CommandOcr).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_command: Option<PathBuf>,

    /// Console width in character cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<u32>,

    /// Console height in character cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
}

impl VmaticConfig {
    /// Load config from `~/.vmatic/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = vmatic_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.vmatic/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = vmatic_dir();
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(dir.join(CONFIG_FILENAME), json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_empty() {
        let config = VmaticConfig::default();
        assert!(config.monitor.is_none());
        assert!(config.training_data.is_none());
        assert!(config.columns.is_none());
    }

    #[test]
    fn roundtrip_serialization() {
        let config = VmaticConfig {
            monitor: Some("/run/vm/qmp.sock".to_string()),
            training_data: Some(PathBuf::from("/etc/vmatic/console.train")),
            ocr_command: None,
            columns: Some(80),
            rows: Some(25),
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: VmaticConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.monitor, config.monitor);
        assert_eq!(loaded.columns, Some(80));
    }

    #[test]
    fn deserialize_empty_json() {
        let loaded: VmaticConfig = serde_json::from_str("{}").unwrap();
        assert!(loaded.monitor.is_none());
    }
}
