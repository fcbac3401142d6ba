//! Instance Registry
//!
//! Table of live instances and the transport handles they own. The table
//! sits behind the driver's coarse lock; each instance carries its own state
//! lock plus an exchange lock that serializes its transport traffic.

use crate::connection::ConnectionTable;
use crate::dispatch::{Callbacks, Envelope, EventSender, Routed};
use crate::error::ShortRangeError;
use crate::handle::{InstanceHandle, SlotAllocator, TransportHandle};
use crate::mode::Mode;
use crate::module::{BleRole, ModuleType};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Mutable state of one instance, guarded by [`InstanceCell::state`]
pub(crate) struct InstanceState {
    /// Transport handle currently bound
    pub transport: TransportHandle,
    pub mode: Mode,
    /// When the data stream becomes usable after a mode change
    pub ready_at: Option<Instant>,
    /// Role last read from the module
    pub ble_role: Option<BleRole>,
    pub callbacks: Callbacks,
    pub connections: ConnectionTable,
}

/// One live instance
pub(crate) struct InstanceCell {
    pub handle: InstanceHandle,
    pub module: ModuleType,
    /// Held across a whole transport exchange; never taken by the dispatcher
    pub exchange: Arc<tokio::sync::Mutex<()>>,
    /// Held only for short inspections and updates
    pub state: parking_lot::Mutex<InstanceState>,
    /// Held by the dispatcher while it routes and runs a callback, and by
    /// callback registration. Reentrant so callbacks may re-register.
    pub delivery: parking_lot::ReentrantMutex<()>,
}

impl InstanceCell {
    fn new(handle: InstanceHandle, module: ModuleType, transport: TransportHandle) -> Self {
        Self {
            handle,
            module,
            exchange: Arc::new(tokio::sync::Mutex::new(())),
            state: parking_lot::Mutex::new(InstanceState {
                transport,
                mode: Mode::Command,
                ready_at: None,
                ble_role: None,
                callbacks: Callbacks::default(),
                connections: ConnectionTable::new(module.profile().max_connections),
            }),
            delivery: parking_lot::ReentrantMutex::new(()),
        }
    }
}

/// Live instances and transport bindings
pub(crate) struct Registry {
    slots: SlotAllocator,
    instances: HashMap<InstanceHandle, Arc<InstanceCell>>,
    bindings: HashMap<TransportHandle, InstanceHandle>,
    events: EventSender,
}

impl Registry {
    pub fn new(slots: SlotAllocator, events: EventSender) -> Self {
        Self {
            slots,
            instances: HashMap::new(),
            bindings: HashMap::new(),
            events,
        }
    }

    /// Create an instance in command mode bound to `transport`
    pub fn add(
        &mut self,
        module: ModuleType,
        transport: TransportHandle,
    ) -> Result<InstanceHandle, ShortRangeError> {
        if self.bindings.contains_key(&transport) {
            return Err(ShortRangeError::AlreadyBound(transport));
        }
        let handle = self
            .slots
            .allocate()
            .ok_or(ShortRangeError::NoResources("instance"))?;
        self.instances.insert(
            handle,
            Arc::new(InstanceCell::new(handle, module, transport)),
        );
        self.bindings.insert(transport, handle);
        info!("Added {} instance {} on {}", module, handle, transport);
        Ok(handle)
    }

    /// Remove an instance; unknown handles are ignored
    pub fn remove(&mut self, handle: InstanceHandle) -> Option<Arc<InstanceCell>> {
        let cell = self.instances.remove(&handle)?;
        self.slots.release(handle);
        self.bindings.retain(|_, owner| *owner != handle);
        let connections = cell.state.lock().connections.len();
        info!(
            "Removed instance {} ({} connections dropped)",
            handle, connections
        );
        Some(cell)
    }

    /// Remove every instance, returning the slot table for reuse
    pub fn teardown(mut self) -> SlotAllocator {
        let handles: Vec<_> = self.instances.keys().copied().collect();
        for handle in handles {
            self.remove(handle);
        }
        self.slots
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<Arc<InstanceCell>> {
        if !self.slots.is_live(handle) {
            return None;
        }
        self.instances.get(&handle).cloned()
    }

    /// Instance owning `transport`
    pub fn owner(&self, transport: TransportHandle) -> Option<InstanceHandle> {
        self.bindings.get(&transport).copied()
    }

    /// Move an instance's binding from `old` to `new`
    pub fn rebind(
        &mut self,
        handle: InstanceHandle,
        old: TransportHandle,
        new: TransportHandle,
    ) -> Result<(), ShortRangeError> {
        if !self.instances.contains_key(&handle) {
            return Err(ShortRangeError::UnknownHandle(handle));
        }
        if let Some(owner) = self.owner(new) {
            if owner != handle {
                return Err(ShortRangeError::AlreadyBound(new));
            }
        }
        if self.bindings.get(&old) == Some(&handle) {
            self.bindings.remove(&old);
        }
        self.bindings.insert(new, handle);
        debug!("Instance {} rebound {} -> {}", handle, old, new);
        Ok(())
    }

    /// Queue an event for delivery to `instance`
    pub fn post(&self, instance: InstanceHandle, event: Routed) -> bool {
        self.events.send(Envelope { instance, event }).is_ok()
    }

    pub fn len(&self) -> usize {
        self.slots.live_count()
    }
}
