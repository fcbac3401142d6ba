//! Extended Data Mode Framing
//!
//! Frame layout: `0xAA`, 16-bit big-endian payload length (upper nibble
//! reserved, zero), payload, `0x55`. The payload starts with a 16-bit
//! identifier/type word followed by packet-specific bytes.

use thiserror::Error;

const START: u8 = 0xAA;
const END: u8 = 0x55;
const HEADER_LEN: usize = 3;
/// Largest payload length the 12-bit length field can carry
pub const MAX_PAYLOAD_LEN: usize = 0x0FFF;
/// Largest data chunk carried by a single data command
pub const MAX_DATA_LEN: usize = 1000;

const CONNECT_EVENT: u16 = 0x0011;
const DISCONNECT_EVENT: u16 = 0x0021;
const DATA_EVENT: u16 = 0x0031;
const DATA_COMMAND: u16 = 0x0036;
const AT_REQUEST: u16 = 0x0044;
const AT_CONFIRMATION: u16 = 0x0045;
const AT_EVENT: u16 = 0x0041;
const START_EVENT: u16 = 0x0071;

/// EDM framing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EdmError {
    /// More bytes are needed to complete the frame
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// First byte is not the start marker
    #[error("Bad start marker {0:02X}")]
    BadStart(u8),

    /// Byte after the payload is not the end marker
    #[error("Bad end marker {0:02X}")]
    BadEnd(u8),

    /// Length field is out of range
    #[error("Invalid payload length {0}")]
    BadLength(usize),
}

/// A decoded EDM packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdmPacket {
    /// Remote peer connected on `channel`
    ConnectEvent { channel: u8, body: Vec<u8> },
    /// Remote peer on `channel` disconnected
    DisconnectEvent { channel: u8 },
    /// Incoming payload on `channel`
    DataEvent { channel: u8, data: Vec<u8> },
    /// Outgoing payload on `channel`
    DataCommand { channel: u8, data: Vec<u8> },
    /// AT command tunnelled through EDM
    AtRequest(Vec<u8>),
    /// Response to a tunnelled AT command
    AtConfirmation(Vec<u8>),
    /// Unsolicited AT line
    AtEvent(Vec<u8>),
    /// Module (re)started in EDM
    StartEvent,
    /// Any packet type not handled above
    Other { kind: u16, body: Vec<u8> },
}

impl EdmPacket {
    fn kind_and_body(&self) -> (u16, Vec<u8>) {
        let with_channel = |channel: u8, rest: &[u8]| {
            let mut body = Vec::with_capacity(rest.len() + 1);
            body.push(channel);
            body.extend_from_slice(rest);
            body
        };
        match self {
            EdmPacket::ConnectEvent { channel, body } => (CONNECT_EVENT, with_channel(*channel, body)),
            EdmPacket::DisconnectEvent { channel } => (DISCONNECT_EVENT, vec![*channel]),
            EdmPacket::DataEvent { channel, data } => (DATA_EVENT, with_channel(*channel, data)),
            EdmPacket::DataCommand { channel, data } => (DATA_COMMAND, with_channel(*channel, data)),
            EdmPacket::AtRequest(line) => (AT_REQUEST, line.clone()),
            EdmPacket::AtConfirmation(line) => (AT_CONFIRMATION, line.clone()),
            EdmPacket::AtEvent(line) => (AT_EVENT, line.clone()),
            EdmPacket::StartEvent => (START_EVENT, Vec::new()),
            EdmPacket::Other { kind, body } => (*kind, body.clone()),
        }
    }

    /// Encode into a complete frame
    pub fn encode(&self) -> Result<Vec<u8>, EdmError> {
        let (kind, body) = self.kind_and_body();
        let payload_len = body.len() + 2;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(EdmError::BadLength(payload_len));
        }
        let mut frame = Vec::with_capacity(payload_len + HEADER_LEN + 1);
        frame.push(START);
        frame.extend_from_slice(&(payload_len as u16).to_be_bytes());
        frame.extend_from_slice(&kind.to_be_bytes());
        frame.extend_from_slice(&body);
        frame.push(END);
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`, returning the packet and
    /// the number of bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(EdmPacket, usize), EdmError> {
        let first = *buf.first().ok_or(EdmError::Incomplete(HEADER_LEN))?;
        if first != START {
            return Err(EdmError::BadStart(first));
        }
        if buf.len() < HEADER_LEN {
            return Err(EdmError::Incomplete(HEADER_LEN - buf.len()));
        }
        let payload_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if !(2..=MAX_PAYLOAD_LEN).contains(&payload_len) {
            return Err(EdmError::BadLength(payload_len));
        }
        let total = HEADER_LEN + payload_len + 1;
        if buf.len() < total {
            return Err(EdmError::Incomplete(total - buf.len()));
        }
        if buf[total - 1] != END {
            return Err(EdmError::BadEnd(buf[total - 1]));
        }

        let payload = &buf[HEADER_LEN..total - 1];
        let kind = u16::from_be_bytes([payload[0], payload[1]]);
        let body = &payload[2..];
        let split = |body: &[u8]| -> Result<(u8, Vec<u8>), EdmError> {
            let (&channel, rest) = body.split_first().ok_or(EdmError::BadLength(payload_len))?;
            Ok((channel, rest.to_vec()))
        };

        let packet = match kind {
            CONNECT_EVENT => {
                let (channel, body) = split(body)?;
                EdmPacket::ConnectEvent { channel, body }
            }
            DISCONNECT_EVENT => EdmPacket::DisconnectEvent {
                channel: split(body)?.0,
            },
            DATA_EVENT => {
                let (channel, data) = split(body)?;
                EdmPacket::DataEvent { channel, data }
            }
            DATA_COMMAND => {
                let (channel, data) = split(body)?;
                EdmPacket::DataCommand { channel, data }
            }
            AT_REQUEST => EdmPacket::AtRequest(body.to_vec()),
            AT_CONFIRMATION => EdmPacket::AtConfirmation(body.to_vec()),
            AT_EVENT => EdmPacket::AtEvent(body.to_vec()),
            START_EVENT => EdmPacket::StartEvent,
            kind => EdmPacket::Other {
                kind,
                body: body.to_vec(),
            },
        };
        Ok((packet, total))
    }
}

/// Frame `data` as one or more data commands on `channel`
pub fn data_frames(channel: u8, data: &[u8]) -> Result<Vec<Vec<u8>>, EdmError> {
    data.chunks(MAX_DATA_LEN)
        .map(|chunk| {
            EdmPacket::DataCommand {
                channel,
                data: chunk.to_vec(),
            }
            .encode()
        })
        .collect()
}
