//! Tool Settings
//!
//! Loaded from an optional TOML file, then `SHORT_RANGE_*` environment
//! variables. Nested driver fields use a double underscore, e.g.
//! `SHORT_RANGE_DRIVER__COMMAND_TIMEOUT_MS=500`.

use crate::error::SerialError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use short_range::{DriverConfig, ModuleType};
use std::path::Path;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SHORT_RANGE";

/// Settings for the serial tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate; the module family's default when unset
    pub baud_rate: Option<u32>,
    /// Module family attached to the port
    pub module: ModuleType,
    /// Log level for the tracing subscriber
    pub log_level: String,
    pub driver: DriverConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: None,
            module: ModuleType::B1,
            log_level: "info".to_string(),
            driver: DriverConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings, reading `path` first when given
    pub fn load(path: Option<&Path>) -> Result<Self, SerialError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Baud rate to open the port with
    pub fn effective_baud_rate(&self) -> u32 {
        self.baud_rate
            .unwrap_or_else(|| self.module.profile().baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.effective_baud_rate(), 115_200);
        assert_eq!(settings.driver, DriverConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("srctl-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "port = \"/dev/ttyACM1\"\nbaud_rate = 57600\n\n[driver]\ncommand_timeout_ms = 750\nble_role = \"central\""
        )
        .unwrap();
        drop(file);

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.port, "/dev/ttyACM1");
        assert_eq!(settings.effective_baud_rate(), 57_600);
        assert_eq!(settings.driver.command_timeout_ms, 750);
        assert_eq!(settings.driver.ble_role, short_range::BleRole::Central);
        assert_eq!(settings.driver.settle_ms, DriverConfig::default().settle_ms);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = Path::new("/nonexistent/srctl.toml");
        assert!(matches!(
            Settings::load(Some(path)),
            Err(SerialError::Settings(_))
        ));
    }
}
