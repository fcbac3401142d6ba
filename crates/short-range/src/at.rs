//! AT Client Adapter
//!
//! The AT client itself (framing, parsing, retries, the UART) lives outside
//! this crate and is consumed through [`AtClient`]. The driver only names
//! the class of each command it issues; [`AtCommand`] renders the text.

use crate::address::BtAddress;
use crate::error::AtClientError;
use crate::handle::TransportHandle;
use crate::module::BleRole;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Buffer length the AT client must provide for this driver.
///
/// Sized for the longest line issued here: an AT-form data write carrying
/// [`MAX_AT_PAYLOAD`] bytes hex encoded, plus its prefix and terminator.
pub const AT_BUFFER_LENGTH_BYTES: usize = 1024;

/// Largest payload accepted by a single command-mode send
pub const MAX_AT_PAYLOAD: usize = (AT_BUFFER_LENGTH_BYTES - 32) / 2;

/// Escape sequence that returns the module to command mode
pub const ESCAPE_SEQUENCE: &[u8] = b"+++";

/// Module-assigned identifier of a link, used in commands and URCs
pub type PeerHandle = i32;

/// Commands issued by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// Liveness check
    Attention,
    /// Disable command echo
    EchoOff,
    /// Read the BLE role
    ReadBleRole,
    /// Write the BLE role
    WriteBleRole(BleRole),
    /// Persist the current configuration
    StoreConfig,
    /// Restart the module
    Restart,
    /// Switch the stream to data mode
    EnterDataMode,
    /// Switch the stream to extended data mode
    EnterExtendedDataMode,
    /// Open an SPS link
    ConnectSps(BtAddress),
    /// Close a link
    ClosePeer(PeerHandle),
    /// Write payload on a link while in command mode
    WriteData { peer: PeerHandle, payload: Vec<u8> },
}

impl AtCommand {
    /// Length of the rendered command including the trailing carriage return
    pub fn encoded_len(&self) -> usize {
        self.to_string().len() + 1
    }

    /// Prefix of the information line carrying this command's result, if any
    pub fn response_prefix(&self) -> Option<&'static str> {
        match self {
            AtCommand::ReadBleRole => Some("+UBTLE:"),
            AtCommand::ConnectSps(_) => Some("+UDCP:"),
            _ => None,
        }
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtCommand::Attention => f.write_str("AT"),
            AtCommand::EchoOff => f.write_str("ATE0"),
            AtCommand::ReadBleRole => f.write_str("AT+UBTLE?"),
            AtCommand::WriteBleRole(role) => write!(f, "AT+UBTLE={}", role.as_number()),
            AtCommand::StoreConfig => f.write_str("AT&W"),
            AtCommand::Restart => f.write_str("AT+CPWROFF"),
            AtCommand::EnterDataMode => f.write_str("ATO1"),
            AtCommand::EnterExtendedDataMode => f.write_str("ATO2"),
            AtCommand::ConnectSps(address) => write!(f, "AT+UDCP=sps://{}", address),
            AtCommand::ClosePeer(peer) => write!(f, "AT+UDCPC={}", peer),
            AtCommand::WriteData { peer, payload } => {
                write!(f, "AT+UDATW={},{}", peer, hex::encode_upper(payload))
            }
        }
    }
}

/// Information lines returned before the final `OK`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtResponse {
    pub lines: Vec<String>,
}

impl AtResponse {
    /// Response with no information lines
    pub fn ok() -> Self {
        Self::default()
    }

    /// Response with a single information line
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
        }
    }

    /// Text following `prefix` on the first line that starts with it
    pub fn value(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }

    /// Parse the integer following `prefix`
    pub fn int_value(&self, prefix: &str) -> Result<i32, AtClientError> {
        self.value(prefix)
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| AtClientError::InvalidResponse(format!("missing {} in {:?}", prefix, self.lines)))
    }
}

/// Command/response access to attached modules.
///
/// A transport handle names one command-mode client on one stream.
/// `detach` stops command parsing on the stream (data modes); the old handle
/// then only accepts `write` until `reattach` issues a fresh handle for the
/// same stream, after which the old handle is dead.
#[async_trait]
pub trait AtClient: Send + Sync {
    /// Send a command and collect its response
    async fn exchange(
        &self,
        transport: TransportHandle,
        command: &AtCommand,
    ) -> Result<AtResponse, AtClientError>;

    /// Write raw bytes on the stream
    async fn write(&self, transport: TransportHandle, bytes: &[u8]) -> Result<(), AtClientError>;

    /// Stop parsing commands on the stream
    async fn detach(&self, transport: TransportHandle) -> Result<(), AtClientError>;

    /// Resume command parsing on the stream, returning the new handle
    async fn reattach(&self, transport: TransportHandle) -> Result<TransportHandle, AtClientError>;
}

/// One instance's view of the AT client: a client, the transport it is bound
/// to, and the exchange timeout.
#[derive(Clone)]
pub struct AtBinding {
    client: Arc<dyn AtClient>,
    transport: TransportHandle,
    timeout: Duration,
}

impl AtBinding {
    /// Bind `client` to `transport`
    pub fn new(client: Arc<dyn AtClient>, transport: TransportHandle, timeout: Duration) -> Self {
        Self {
            client,
            transport,
            timeout,
        }
    }

    /// Bound transport handle
    pub fn transport(&self) -> TransportHandle {
        self.transport
    }

    /// Exchange a command within the binding's timeout
    pub async fn exchange(&self, command: &AtCommand) -> Result<AtResponse, AtClientError> {
        self.exchange_within(command, self.timeout).await
    }

    /// Exchange a command within an explicit timeout
    pub async fn exchange_within(
        &self,
        command: &AtCommand,
        timeout: Duration,
    ) -> Result<AtResponse, AtClientError> {
        debug!("{} <- {}", self.transport, command);
        let response = tokio::time::timeout(timeout, self.client.exchange(self.transport, command))
            .await
            .map_err(|_| AtClientError::Timeout(timeout.as_millis() as u64))??;
        debug!("{} -> {:?}", self.transport, response.lines);
        Ok(response)
    }

    /// Write raw bytes within the binding's timeout
    pub async fn write(&self, bytes: &[u8]) -> Result<(), AtClientError> {
        tokio::time::timeout(self.timeout, self.client.write(self.transport, bytes))
            .await
            .map_err(|_| AtClientError::Timeout(self.timeout.as_millis() as u64))?
    }

    /// Detach the stream from command parsing
    pub async fn detach(&self) -> Result<(), AtClientError> {
        self.client.detach(self.transport).await
    }

    /// Reattach command parsing, returning a binding to the new handle
    pub async fn reattach(&self) -> Result<AtBinding, AtClientError> {
        let transport =
            tokio::time::timeout(self.timeout, self.client.reattach(self.transport))
                .await
                .map_err(|_| AtClientError::Timeout(self.timeout.as_millis() as u64))??;
        Ok(Self {
            client: Arc::clone(&self.client),
            transport,
            timeout: self.timeout,
        })
    }
}
