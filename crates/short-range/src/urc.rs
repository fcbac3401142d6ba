//! Unsolicited Result Code Decoding
//!
//! Turns link status lines emitted by the module into [`ModuleEvent`]s.
//! Lines this driver does not track decode to `None`.

use crate::address::BtAddress;
use crate::dispatch::ModuleEvent;
use tracing::debug;

const PEER_CONNECTED: &str = "+UUDPC:";
const PEER_DISCONNECTED: &str = "+UUDPD:";
const ACL_CONNECTED: &str = "+UUBTACLC:";
const ACL_DISCONNECTED: &str = "+UUBTACLD:";

/// Peer type value for Bluetooth links
const PEER_TYPE_BLUETOOTH: &str = "1";
/// Profile value for SPS links
const PROFILE_SPS: &str = "4";

/// Whether `line` is an unsolicited result code rather than a command response
pub fn is_urc(line: &str) -> bool {
    line.starts_with("+UU")
}

/// Decode one URC line
pub fn parse(line: &str) -> Option<ModuleEvent> {
    let line = line.trim();
    let event = if let Some(args) = line.strip_prefix(PEER_CONNECTED) {
        let fields: Vec<&str> = args.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [peer, PEER_TYPE_BLUETOOTH, PROFILE_SPS, address, ..] => ModuleEvent::SpsConnected {
                peer: peer.parse().ok()?,
                address: BtAddress::parse(address).ok()?,
            },
            _ => {
                debug!("Ignoring non-SPS peer connection: {}", line);
                return None;
            }
        }
    } else if let Some(args) = line.strip_prefix(PEER_DISCONNECTED) {
        ModuleEvent::SpsDisconnected {
            peer: args.trim().parse().ok()?,
        }
    } else if let Some(args) = line.strip_prefix(ACL_CONNECTED) {
        let fields: Vec<&str> = args.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [link, _kind, address, ..] => ModuleEvent::BtConnected {
                link: link.parse().ok()?,
                address: BtAddress::parse(address).ok()?,
            },
            _ => return None,
        }
    } else if let Some(args) = line.strip_prefix(ACL_DISCONNECTED) {
        ModuleEvent::BtDisconnected {
            link: args.trim().parse().ok()?,
        }
    } else {
        return None;
    };
    Some(event)
}
