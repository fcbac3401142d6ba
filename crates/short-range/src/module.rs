//! Module Families and BLE Roles

use crate::error::ShortRangeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported short-range module families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleType {
    /// NINA-B1 and ANNA-B1
    B1,
}

/// Static capabilities of a module family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleProfile {
    /// Marketing names covered by the family
    pub name: &'static str,
    /// Default UART baud rate
    pub baud_rate: u32,
    /// Maximum simultaneous SPS links
    pub max_connections: usize,
    /// Whether the module supports extended data mode
    pub supports_edm: bool,
    /// Worst-case time from restart command to accepting commands again
    pub boot_time: Duration,
}

const B1_PROFILE: ModuleProfile = ModuleProfile {
    name: "NINA-B1/ANNA-B1",
    baud_rate: 115_200,
    max_connections: 3,
    supports_edm: true,
    boot_time: Duration::from_millis(500),
};

impl ModuleType {
    /// Every known module family, in numeric order
    pub const ALL: [ModuleType; 1] = [ModuleType::B1];

    /// Capability table entry for this family
    pub fn profile(&self) -> &'static ModuleProfile {
        match self {
            ModuleType::B1 => &B1_PROFILE,
        }
    }
}

impl TryFrom<i32> for ModuleType {
    type Error = ShortRangeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or_else(|| ShortRangeError::ValueOutOfRange(format!("module type {}", value)))
    }
}

impl FromStr for ModuleType {
    type Err = ShortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "B1" | "NINA-B1" | "ANNA-B1" => Ok(ModuleType::B1),
            _ => Err(ShortRangeError::ValueOutOfRange(format!("module type {:?}", s))),
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().name)
    }
}

/// Bluetooth Low Energy role reported by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BleRole {
    Disabled,
    Central,
    Peripheral,
    CentralAndPeripheral,
}

impl BleRole {
    /// Numeric value used by the role command
    pub fn as_number(&self) -> u8 {
        match self {
            BleRole::Disabled => 0,
            BleRole::Central => 1,
            BleRole::Peripheral => 2,
            BleRole::CentralAndPeripheral => 3,
        }
    }

    /// Decode the module's numeric role
    pub fn from_number(value: u8) -> Option<Self> {
        match value {
            0 => Some(BleRole::Disabled),
            1 => Some(BleRole::Central),
            2 => Some(BleRole::Peripheral),
            3 => Some(BleRole::CentralAndPeripheral),
            _ => None,
        }
    }

    /// Whether the role can initiate outgoing connections
    pub fn can_initiate(&self) -> bool {
        matches!(self, BleRole::Central | BleRole::CentralAndPeripheral)
    }
}

impl Default for BleRole {
    fn default() -> Self {
        BleRole::Peripheral
    }
}
