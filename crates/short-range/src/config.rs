//! Driver Configuration

use crate::error::ShortRangeError;
use crate::module::BleRole;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Short-range driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Maximum number of simultaneously live instances (1..=256)
    pub max_instances: usize,
    /// Timeout for a single AT exchange (milliseconds)
    pub command_timeout_ms: u64,
    /// Settling delay after entering data or extended data mode (milliseconds)
    pub settle_ms: u64,
    /// Silence kept on both sides of the escape sequence (milliseconds)
    pub escape_guard_ms: u64,
    /// Upper bound for the whole command-mode recovery (milliseconds)
    pub recovery_timeout_ms: u64,
    /// Attention attempts after a configuration restart
    pub boot_attempts: u8,
    /// BLE role written by `configure`
    pub ble_role: BleRole,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            command_timeout_ms: 2000,
            settle_ms: 50,
            escape_guard_ms: 1000,
            recovery_timeout_ms: 5000,
            boot_attempts: 3,
            ble_role: BleRole::Peripheral,
        }
    }
}

impl DriverConfig {
    /// Check that every field is within its accepted range
    pub fn validate(&self) -> Result<(), ShortRangeError> {
        if !(1..=256).contains(&self.max_instances) {
            return Err(ShortRangeError::ValueOutOfRange(format!(
                "max_instances {}",
                self.max_instances
            )));
        }
        if self.command_timeout_ms == 0 || self.recovery_timeout_ms == 0 {
            return Err(ShortRangeError::ValueOutOfRange("zero timeout".to_string()));
        }
        if self.recovery_timeout_ms <= 2 * self.escape_guard_ms {
            return Err(ShortRangeError::ValueOutOfRange(format!(
                "recovery_timeout_ms {} leaves no time after escape guards",
                self.recovery_timeout_ms
            )));
        }
        if self.boot_attempts == 0 {
            return Err(ShortRangeError::ValueOutOfRange("boot_attempts 0".to_string()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn escape_guard(&self) -> Duration {
        Duration::from_millis(self.escape_guard_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}
