//! Short-Range Error Types

use crate::connection::ConnectionStatus;
use crate::handle::{ConnHandle, InstanceHandle, TransportHandle};
use crate::mode::{Mode, Operation};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an AT client exchange
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AtClientError {
    /// No final result code within the allowed time
    #[error("Timeout waiting for AT response after {0}ms")]
    Timeout(u64),

    /// The module answered with an error result code
    #[error("Module returned ERROR for {0}")]
    ErrorResult(String),

    /// The response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The transport handle is not (or no longer) attached
    #[error("Transport {0} is not attached")]
    Detached(TransportHandle),

    /// Serial or stream I/O failure
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AtClientError {
    fn from(err: std::io::Error) -> Self {
        AtClientError::Io(err.to_string())
    }
}

/// Errors returned by the short-range driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShortRangeError {
    /// The AT exchange failed or timed out
    #[error("AT exchange failed: {0}")]
    At(#[from] AtClientError),

    /// The driver has not been initialised
    #[error("Short-range driver is not initialised")]
    NotConfigured,

    /// The handle does not refer to a live instance
    #[error("Unknown short-range instance {0}")]
    UnknownHandle(InstanceHandle),

    /// A parameter is outside its accepted domain
    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    /// The operation is not legal in the instance's current mode
    #[error("{operation} is not allowed in {mode} mode")]
    InvalidMode { operation: Operation, mode: Mode },

    /// The connection cannot carry data in its current state
    #[error("Connection {conn} is {status}")]
    ConnectionNotReady {
        conn: ConnHandle,
        status: ConnectionStatus,
    },

    /// The data-mode settling delay has not elapsed yet
    #[error("Data stream not ready for another {}ms", .remaining.as_millis())]
    NotReady { remaining: Duration },

    /// Another live instance already owns this transport handle
    #[error("Transport {0} is already bound to an instance")]
    AlreadyBound(TransportHandle),

    /// No instance or connection slot is free
    #[error("No free {0} slot")]
    NoResources(&'static str),
}

/// Coarse error classes with the module family's numeric codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    AtFailure = -4096,
    NotConfigured = -4097,
    ValueOutOfRange = -4098,
    InvalidMode = -4099,
}

impl ErrorKind {
    /// Numeric error code
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl From<i32> for ErrorKind {
    fn from(code: i32) -> Self {
        match code {
            -4097 => Self::NotConfigured,
            -4098 => Self::ValueOutOfRange,
            -4099 => Self::InvalidMode,
            _ => Self::AtFailure,
        }
    }
}

impl ShortRangeError {
    /// Class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::At(_) => ErrorKind::AtFailure,
            Self::NotConfigured | Self::UnknownHandle(_) => ErrorKind::NotConfigured,
            Self::ValueOutOfRange(_) | Self::AlreadyBound(_) | Self::NoResources(_) => {
                ErrorKind::ValueOutOfRange
            }
            Self::InvalidMode { .. } | Self::ConnectionNotReady { .. } | Self::NotReady { .. } => {
                ErrorKind::InvalidMode
            }
        }
    }

    /// Numeric error code of this error's class
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}
