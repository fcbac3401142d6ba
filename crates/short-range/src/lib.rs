//! Short-Range Module Driver
//!
//! Drives u-blox style short-range radio modules (BLE / Wi-Fi companions)
//! attached over a serial AT command transport. Each attached module is an
//! instance with a stable handle, moved between command, data and extended
//! data mode, with module-originated events routed to per-instance callbacks.
//!
//! The AT client itself is an external collaborator consumed through
//! [`AtClient`]; module events come back in through [`EventSink`].

mod address;
mod at;
mod config;
mod connection;
mod dispatch;
mod driver;
mod error;
mod handle;
mod mode;
mod module;
mod registry;

pub mod edm;
pub mod urc;

pub use address::{AddressType, BtAddress};
pub use at::{
    AtBinding, AtClient, AtCommand, AtResponse, PeerHandle, AT_BUFFER_LENGTH_BYTES,
    ESCAPE_SEQUENCE, MAX_AT_PAYLOAD,
};
pub use config::DriverConfig;
pub use connection::{Connection, ConnectionStatus};
pub use dispatch::{
    BtStatusEvent, Callback, DataEvent, EventClass, EventSink, ModuleEvent, SpsStatusEvent,
};
pub use driver::ShortRange;
pub use error::{AtClientError, ErrorKind, ShortRangeError};
pub use handle::{ConnHandle, InstanceHandle, TransportHandle};
pub use mode::{Mode, ModeChange, Operation, DATA_MODE_SETTLE};
pub use module::{BleRole, ModuleProfile, ModuleType};
