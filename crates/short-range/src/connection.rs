//! SPS Connection Table
//!
//! One table per instance. Connection handles are issued by the driver and
//! go back to the pool only when the dispatcher reaps a disconnected entry.
//! Module status events are correlated through the module's peer handle.

use crate::address::BtAddress;
use crate::at::PeerHandle;
use crate::error::ShortRangeError;
use crate::handle::{ConnHandle, ConnHandlePool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Lifecycle state of an SPS link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        })
    }
}

/// One SPS link of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Driver-issued handle
    pub handle: ConnHandle,
    /// Module-issued link identifier
    pub peer: PeerHandle,
    /// Remote device
    pub address: BtAddress,
    pub status: ConnectionStatus,
}

/// Connections of one instance
#[derive(Debug, Clone)]
pub struct ConnectionTable {
    entries: BTreeMap<ConnHandle, Connection>,
    pool: ConnHandlePool,
}

impl ConnectionTable {
    /// Create a table with room for `capacity` simultaneous links
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            pool: ConnHandlePool::new(capacity),
        }
    }

    /// Whether another link can be recorded
    pub fn has_free_slot(&self) -> bool {
        self.pool.available() > 0
    }

    /// Record an outgoing link in `Connecting` state
    pub fn open(&mut self, peer: PeerHandle, address: BtAddress) -> Result<ConnHandle, ShortRangeError> {
        self.insert(peer, address, ConnectionStatus::Connecting)
    }

    fn insert(
        &mut self,
        peer: PeerHandle,
        address: BtAddress,
        status: ConnectionStatus,
    ) -> Result<ConnHandle, ShortRangeError> {
        if let Some(stale) = self.live_by_peer(peer) {
            // The module only reissues a peer handle once the old link is gone.
            warn!("Peer handle {} reissued, dropping stale connection {}", peer, stale);
            self.remove(stale);
        }
        // A locally closed entry with this peer keeps its handle until reaped
        let handle = self
            .pool
            .allocate()
            .ok_or(ShortRangeError::NoResources("connection"))?;
        self.entries.insert(
            handle,
            Connection {
                handle,
                peer,
                address,
                status,
            },
        );
        Ok(handle)
    }

    /// Look up a connection
    pub fn get(&self, handle: ConnHandle) -> Option<&Connection> {
        self.entries.get(&handle)
    }

    /// Find the connection bound to a module peer handle. An open entry
    /// wins over one closed locally and still waiting to be reaped.
    pub fn by_peer(&self, peer: PeerHandle) -> Option<ConnHandle> {
        self.live_by_peer(peer).or_else(|| {
            self.entries
                .values()
                .find(|c| c.peer == peer)
                .map(|c| c.handle)
        })
    }

    fn live_by_peer(&self, peer: PeerHandle) -> Option<ConnHandle> {
        self.entries
            .values()
            .find(|c| c.peer == peer && c.status != ConnectionStatus::Disconnected)
            .map(|c| c.handle)
    }

    /// Apply a module "connected" report. Returns the connection to notify
    /// about, or `None` if the report changes nothing.
    pub fn on_connected(&mut self, peer: PeerHandle, address: BtAddress) -> Option<Connection> {
        if let Some(handle) = self.by_peer(peer) {
            let entry = self.entries.get_mut(&handle)?;
            return match entry.status {
                ConnectionStatus::Connecting => {
                    entry.status = ConnectionStatus::Connected;
                    Some(entry.clone())
                }
                ConnectionStatus::Connected => {
                    debug!("Duplicate connect report for connection {}", handle);
                    None
                }
                // Closed locally, the synthesized disconnect will reap it.
                ConnectionStatus::Disconnected => None,
            };
        }

        match self.insert(peer, address, ConnectionStatus::Connected) {
            Ok(handle) => self.entries.get(&handle).cloned(),
            Err(_) => {
                warn!("No free connection slot for inbound link from {}", address);
                None
            }
        }
    }

    /// Apply a module "disconnected" report, reaping the connection.
    pub fn on_disconnected(&mut self, peer: PeerHandle) -> Option<Connection> {
        let handle = self.by_peer(peer)?;
        if self.entries.get(&handle)?.status == ConnectionStatus::Disconnected {
            return None;
        }
        self.reap(handle)
    }

    /// Mark a connection closed locally. Only succeeds if the entry still
    /// belongs to `peer` and was not already closed.
    pub fn mark_disconnected(&mut self, handle: ConnHandle, peer: PeerHandle) -> bool {
        match self.entries.get_mut(&handle) {
            Some(entry) if entry.peer == peer && entry.status != ConnectionStatus::Disconnected => {
                entry.status = ConnectionStatus::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Mark every open connection closed, returning their handles
    pub fn mark_all_disconnected(&mut self) -> Vec<ConnHandle> {
        self.entries
            .values_mut()
            .filter(|c| c.status != ConnectionStatus::Disconnected)
            .map(|c| {
                c.status = ConnectionStatus::Disconnected;
                c.handle
            })
            .collect()
    }

    /// Remove a closed connection and recycle its handle
    pub fn reap(&mut self, handle: ConnHandle) -> Option<Connection> {
        let mut entry = self.remove(handle)?;
        entry.status = ConnectionStatus::Disconnected;
        Some(entry)
    }

    fn remove(&mut self, handle: ConnHandle) -> Option<Connection> {
        let entry = self.entries.remove(&handle)?;
        self.pool.release(handle);
        Some(entry)
    }

    /// Snapshot of all entries, ordered by handle
    pub fn snapshot(&self) -> Vec<Connection> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
