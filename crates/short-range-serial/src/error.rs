//! Serial Tool Error Types

use short_range::ShortRangeError;
use thiserror::Error;

/// Errors raised while setting up the serial link
#[derive(Debug, Error)]
pub enum SerialError {
    /// The serial device could not be opened
    #[error("Failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// Settings could not be loaded
    #[error("Invalid settings: {0}")]
    Settings(#[from] config::ConfigError),

    /// The driver rejected a request
    #[error(transparent)]
    Driver(#[from] ShortRangeError),
}
