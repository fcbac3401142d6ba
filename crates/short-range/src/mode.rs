//! Communication Modes and Transition Rules

use crate::error::ShortRangeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Delay required after entering data or extended data mode before payload may be sent
pub const DATA_MODE_SETTLE: Duration = Duration::from_millis(50);

/// Communication mode of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Textual AT command/response exchanges
    Command,
    /// Raw application payload on the stream
    Data,
    /// Length/type framed payload on the stream
    ExtendedData,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Command
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Command => "command",
            Mode::Data => "data",
            Mode::ExtendedData => "extended data",
        })
    }
}

/// Operations whose legality depends on the mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Attention,
    Configure,
    CheckBleRole,
    ConnectSps,
    Disconnect,
    EnterDataMode,
    EnterExtendedDataMode,
    EnterCommandMode,
    Send,
}

impl Operation {
    /// Whether the operation needs the module to be parsing AT commands
    pub fn requires_command_mode(&self) -> bool {
        !matches!(self, Operation::EnterCommandMode | Operation::Send)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Attention => "attention",
            Operation::Configure => "configure",
            Operation::CheckBleRole => "check BLE role",
            Operation::ConnectSps => "connect SPS",
            Operation::Disconnect => "disconnect",
            Operation::EnterDataMode => "enter data mode",
            Operation::EnterExtendedDataMode => "enter extended data mode",
            Operation::EnterCommandMode => "enter command mode",
            Operation::Send => "send",
        })
    }
}

impl Mode {
    /// Check that `operation` may start in this mode
    pub fn check(&self, operation: Operation) -> Result<(), ShortRangeError> {
        if operation.requires_command_mode() && *self != Mode::Command {
            return Err(ShortRangeError::InvalidMode {
                operation,
                mode: *self,
            });
        }
        Ok(())
    }

    /// Mode reached when `operation` succeeds from this mode
    pub fn after(&self, operation: Operation) -> Mode {
        match operation {
            Operation::EnterDataMode => Mode::Data,
            Operation::EnterExtendedDataMode => Mode::ExtendedData,
            Operation::EnterCommandMode => Mode::Command,
            _ => *self,
        }
    }

    /// Whether payload goes straight onto the stream
    pub fn is_streaming(&self) -> bool {
        matches!(self, Mode::Data | Mode::ExtendedData)
    }
}

/// Outcome of entering data or extended data mode.
///
/// The stream only accepts payload once `ready_at` has passed. Entering the
/// mode never sleeps; callers that want to wait call [`ModeChange::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    /// Mode now in effect
    pub mode: Mode,
    /// Earliest instant payload may be transmitted
    pub ready_at: Instant,
}

impl ModeChange {
    /// Create a mode change that settles after `delay`
    pub fn new(mode: Mode, delay: Duration) -> Self {
        Self {
            mode,
            ready_at: Instant::now() + delay,
        }
    }

    /// Time left before payload may be sent
    pub fn remaining(&self) -> Duration {
        self.ready_at.saturating_duration_since(Instant::now())
    }

    /// Wait out the settling delay
    pub async fn settle(&self) {
        tokio::time::sleep_until(self.ready_at).await;
    }
}
