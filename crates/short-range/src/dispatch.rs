//! Event Routing and Callback Delivery
//!
//! Module-originated events enter through [`EventSink::post`], get tagged
//! with the owning instance, and travel over one channel to a single
//! delivery task. That task applies connection bookkeeping under the
//! instance lock, then invokes the registered callback with no lock held.
//! One producer and one consumer per channel keep per-instance order.

use crate::address::BtAddress;
use crate::at::PeerHandle;
use crate::connection::{Connection, ConnectionStatus};
use crate::driver::Shared;
use crate::handle::{ConnHandle, InstanceHandle, TransportHandle};
use crate::registry::InstanceState;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events reported by the module through the AT client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleEvent {
    /// Incoming payload; `peer` is known in command and extended data mode
    Data {
        peer: Option<PeerHandle>,
        payload: Vec<u8>,
    },
    /// Bluetooth ACL link came up
    BtConnected { link: i32, address: BtAddress },
    /// Bluetooth ACL link went down
    BtDisconnected { link: i32 },
    /// SPS link came up
    SpsConnected { peer: PeerHandle, address: BtAddress },
    /// SPS link went down
    SpsDisconnected { peer: PeerHandle },
}

/// Incoming payload delivered to the data callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    /// Connection the payload arrived on, when the stream identifies it
    pub conn: Option<ConnHandle>,
    pub payload: Vec<u8>,
}

/// Bluetooth link status delivered to the BT status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtStatusEvent {
    /// Module link identifier
    pub link: i32,
    pub address: Option<BtAddress>,
    pub connected: bool,
}

/// SPS link status delivered to the SPS status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsStatusEvent {
    pub conn: ConnHandle,
    pub address: BtAddress,
    pub status: ConnectionStatus,
}

impl From<Connection> for SpsStatusEvent {
    fn from(connection: Connection) -> Self {
        Self {
            conn: connection.handle,
            address: connection.address,
            status: connection.status,
        }
    }
}

/// A registered callback; the closure captures whatever context it needs
pub type Callback<E> = Arc<dyn Fn(InstanceHandle, &E) + Send + Sync>;

/// Event classes that accept a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Data,
    BtStatus,
    SpsStatus,
}

/// Callback registrations of one instance
#[derive(Default, Clone)]
pub struct Callbacks {
    pub data: Option<Callback<DataEvent>>,
    pub bt_status: Option<Callback<BtStatusEvent>>,
    pub sps_status: Option<Callback<SpsStatusEvent>>,
}

impl Callbacks {
    /// Drop the registration for `class`
    pub fn clear(&mut self, class: EventClass) {
        match class {
            EventClass::Data => self.data = None,
            EventClass::BtStatus => self.bt_status = None,
            EventClass::SpsStatus => self.sps_status = None,
        }
    }
}

/// What travels over the delivery channel
#[derive(Debug)]
pub(crate) enum Routed {
    /// Reported by the module
    Module(ModuleEvent),
    /// Closed by `disconnect` or `configure`; reap and report
    LocalDisconnect(ConnHandle),
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub instance: InstanceHandle,
    pub event: Routed,
}

pub(crate) type EventSender = mpsc::UnboundedSender<Envelope>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Envelope>;

/// A callback paired with its event, ready to run outside every lock
enum Delivery {
    Data(Callback<DataEvent>, DataEvent),
    BtStatus(Callback<BtStatusEvent>, BtStatusEvent),
    SpsStatus(Callback<SpsStatusEvent>, SpsStatusEvent),
}

impl Delivery {
    fn deliver(self, instance: InstanceHandle) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            Delivery::Data(cb, event) => cb(instance, &event),
            Delivery::BtStatus(cb, event) => cb(instance, &event),
            Delivery::SpsStatus(cb, event) => cb(instance, &event),
        }));
        if outcome.is_err() {
            warn!("Callback for instance {} panicked", instance);
        }
    }
}

/// Apply `event` to the instance state and pick the callback to run.
fn route(state: &mut InstanceState, event: Routed) -> Option<Delivery> {
    match event {
        Routed::Module(ModuleEvent::Data { peer, payload }) => {
            let conn = peer.and_then(|p| state.connections.by_peer(p));
            let cb = state.callbacks.data.clone()?;
            Some(Delivery::Data(cb, DataEvent { conn, payload }))
        }
        Routed::Module(ModuleEvent::BtConnected { link, address }) => {
            let cb = state.callbacks.bt_status.clone()?;
            Some(Delivery::BtStatus(
                cb,
                BtStatusEvent {
                    link,
                    address: Some(address),
                    connected: true,
                },
            ))
        }
        Routed::Module(ModuleEvent::BtDisconnected { link }) => {
            let cb = state.callbacks.bt_status.clone()?;
            Some(Delivery::BtStatus(
                cb,
                BtStatusEvent {
                    link,
                    address: None,
                    connected: false,
                },
            ))
        }
        Routed::Module(ModuleEvent::SpsConnected { peer, address }) => {
            let connection = state.connections.on_connected(peer, address)?;
            let cb = state.callbacks.sps_status.clone()?;
            Some(Delivery::SpsStatus(cb, connection.into()))
        }
        Routed::Module(ModuleEvent::SpsDisconnected { peer }) => {
            let connection = state.connections.on_disconnected(peer)?;
            let cb = state.callbacks.sps_status.clone()?;
            Some(Delivery::SpsStatus(cb, connection.into()))
        }
        Routed::LocalDisconnect(conn) => {
            let connection = state.connections.reap(conn)?;
            let cb = state.callbacks.sps_status.clone()?;
            Some(Delivery::SpsStatus(cb, connection.into()))
        }
    }
}

/// Delivery task body; exits when every sender is gone or the driver is dropped.
pub(crate) async fn run(shared: Weak<Shared>, mut events: EventReceiver) {
    debug!("Event dispatcher started");
    while let Some(envelope) = events.recv().await {
        let Some(driver) = shared.upgrade() else {
            break;
        };
        let Some(cell) = driver.lookup(envelope.instance) else {
            debug!("Dropping event for removed instance {}", envelope.instance);
            continue;
        };
        drop(driver);

        // Registration waits for this, so a replaced callback never runs late
        let _delivering = cell.delivery.lock();
        let delivery = {
            let mut state = cell.state.lock();
            route(&mut state, envelope.event)
        };
        if let Some(delivery) = delivery {
            delivery.deliver(envelope.instance);
        }
    }
    debug!("Event dispatcher stopped");
}

/// Entry point for module-originated events, handed to the AT client.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<Shared>,
}

impl EventSink {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// Queue an event reported on `transport`. Returns `false` if no live
    /// instance is bound to it, in which case the event is discarded.
    pub fn post(&self, transport: TransportHandle, event: ModuleEvent) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let queued = shared.post_from_transport(transport, event);
        if !queued {
            debug!("No instance bound to {}, event discarded", transport);
        }
        queued
    }
}
