//! Short-Range Serial Tooling
//!
//! A serial-port [`AtClient`](short_range::AtClient) for the short-range
//! driver, settings loading and logging setup for the `srctl` tool.

mod client;
mod error;
mod settings;

pub use client::SerialAtClient;
pub use error::SerialError;
pub use settings::{Settings, ENV_PREFIX};

use std::str::FromStr;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize logging at `level` ("error" through "trace"); unknown levels
/// fall back to info
pub fn init_logging(level: &str) -> Result<(), SetGlobalDefaultError> {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}
