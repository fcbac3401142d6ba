//! Short-Range Driver
//!
//! [`ShortRange`] is the lifecycle object for every attached module: `init`
//! brings up the registry and the event dispatcher, `deinit` tears both
//! down. Operations resolve a handle, take the instance's exchange lock,
//! validate the mode under the short state lock, talk to the module with no
//! state lock held, and commit the outcome under the state lock again. A
//! failed exchange commits nothing.

use crate::address::BtAddress;
use crate::at::{AtBinding, AtClient, AtCommand, ESCAPE_SEQUENCE, MAX_AT_PAYLOAD};
use crate::config::DriverConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::dispatch::{
    self, BtStatusEvent, Callbacks, DataEvent, EventClass, EventSink, ModuleEvent, Routed,
    SpsStatusEvent,
};
use crate::edm;
use crate::error::{AtClientError, ShortRangeError};
use crate::handle::{ConnHandle, InstanceHandle, SlotAllocator, TransportHandle};
use crate::mode::{Mode, ModeChange, Operation};
use crate::module::{BleRole, ModuleType};
use crate::registry::{InstanceCell, InstanceState, Registry};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State shared between the driver handle, event sinks and the dispatcher
pub(crate) struct Shared {
    at: Arc<dyn AtClient>,
    config: DriverConfig,
    registry: RwLock<Option<Registry>>,
    /// Slot table kept across `deinit` so handles never repeat
    spare_slots: Mutex<Option<SlotAllocator>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn lookup(&self, handle: InstanceHandle) -> Option<Arc<InstanceCell>> {
        self.registry.read().as_ref()?.get(handle)
    }

    pub(crate) fn post_from_transport(&self, transport: TransportHandle, event: ModuleEvent) -> bool {
        let registry = self.registry.read();
        let Some(registry) = registry.as_ref() else {
            return false;
        };
        match registry.owner(transport) {
            Some(instance) => registry.post(instance, Routed::Module(event)),
            None => false,
        }
    }

    fn post_local(&self, instance: InstanceHandle, conn: ConnHandle) {
        if let Some(registry) = self.registry.read().as_ref() {
            registry.post(instance, Routed::LocalDisconnect(conn));
        }
    }

    fn resolve(&self, handle: InstanceHandle) -> Result<Arc<InstanceCell>, ShortRangeError> {
        let registry = self.registry.read();
        let registry = registry.as_ref().ok_or(ShortRangeError::NotConfigured)?;
        registry
            .get(handle)
            .ok_or(ShortRangeError::UnknownHandle(handle))
    }
}

/// Exclusive use of one instance's transport for the length of an operation
struct Session {
    cell: Arc<InstanceCell>,
    at: AtBinding,
    mode: Mode,
    _exchange: OwnedMutexGuard<()>,
}

/// Driver for short-range radio modules attached through an AT client
#[derive(Clone)]
pub struct ShortRange {
    shared: Arc<Shared>,
}

impl ShortRange {
    /// Create a driver with the default configuration
    pub fn new(at: Arc<dyn AtClient>) -> Self {
        Self::with_config(at, DriverConfig::default())
    }

    /// Create a driver with an explicit configuration
    pub fn with_config(at: Arc<dyn AtClient>, config: DriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                at,
                config,
                registry: RwLock::new(None),
                spare_slots: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Driver configuration
    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Sink the AT client posts module events into
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(Arc::downgrade(&self.shared))
    }

    /// Whether `init` has run without a matching `deinit`
    pub fn is_initialized(&self) -> bool {
        self.shared.registry.read().is_some()
    }

    /// Bring up the registry and the event dispatcher. Calling it again
    /// while initialised does nothing. Must run inside a Tokio runtime.
    pub async fn init(&self) -> Result<(), ShortRangeError> {
        self.shared.config.validate()?;
        let mut registry = self.shared.registry.write();
        if registry.is_some() {
            return Ok(());
        }

        let slots = self
            .shared
            .spare_slots
            .lock()
            .take()
            .unwrap_or_else(|| SlotAllocator::new(self.shared.config.max_instances));
        let (tx, rx) = mpsc::unbounded_channel();
        *registry = Some(Registry::new(slots, tx));
        let task = tokio::spawn(dispatch::run(Arc::downgrade(&self.shared), rx));
        *self.shared.dispatcher.lock() = Some(task);

        info!(
            "Short-range driver initialised ({} instance slots)",
            self.shared.config.max_instances
        );
        Ok(())
    }

    /// Remove every instance and stop the dispatcher once it has drained.
    pub async fn deinit(&self) {
        // Slots and dispatcher are handed back before a racing `init` can see
        // the empty registry.
        let (live, task) = {
            let mut registry = self.shared.registry.write();
            let Some(taken) = registry.take() else {
                return;
            };
            let live = taken.len();
            *self.shared.spare_slots.lock() = Some(taken.teardown());
            (live, self.shared.dispatcher.lock().take())
        };

        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!("Event dispatcher ended abnormally: {}", err);
            }
        }
        info!("Short-range driver shut down ({} instances removed)", live);
    }

    /// Add an instance for `module` bound to `transport`. No I/O happens.
    pub fn add(
        &self,
        module: ModuleType,
        transport: TransportHandle,
    ) -> Result<InstanceHandle, ShortRangeError> {
        let mut registry = self.shared.registry.write();
        registry
            .as_mut()
            .ok_or(ShortRangeError::NotConfigured)?
            .add(module, transport)
    }

    /// Remove an instance and its connections. Nothing is sent to the module;
    /// the caller is expected to have disconnected or powered it down.
    /// Unknown handles are ignored.
    pub fn remove(&self, handle: InstanceHandle) {
        if let Some(registry) = self.shared.registry.write().as_mut() {
            registry.remove(handle);
        }
    }

    /// Register the incoming data callback, replacing any previous one.
    ///
    /// If the old callback is running on the dispatcher this waits for it
    /// to return; once this returns the old callback is never invoked again.
    pub fn set_data_callback<F>(&self, handle: InstanceHandle, callback: F) -> Result<(), ShortRangeError>
    where
        F: Fn(InstanceHandle, &DataEvent) + Send + Sync + 'static,
    {
        self.update_callbacks(handle, |callbacks| {
            callbacks.data = Some(Arc::new(callback))
        })
    }

    /// Register the Bluetooth link status callback, replacing any previous one
    pub fn set_bt_status_callback<F>(&self, handle: InstanceHandle, callback: F) -> Result<(), ShortRangeError>
    where
        F: Fn(InstanceHandle, &BtStatusEvent) + Send + Sync + 'static,
    {
        self.update_callbacks(handle, |callbacks| {
            callbacks.bt_status = Some(Arc::new(callback))
        })
    }

    /// Register the SPS link status callback, replacing any previous one
    pub fn set_sps_status_callback<F>(&self, handle: InstanceHandle, callback: F) -> Result<(), ShortRangeError>
    where
        F: Fn(InstanceHandle, &SpsStatusEvent) + Send + Sync + 'static,
    {
        self.update_callbacks(handle, |callbacks| {
            callbacks.sps_status = Some(Arc::new(callback))
        })
    }

    /// Drop the callback registered for `class`
    pub fn clear_callback(&self, handle: InstanceHandle, class: EventClass) -> Result<(), ShortRangeError> {
        self.update_callbacks(handle, |callbacks| callbacks.clear(class))
    }

    /// Change registrations once no callback of the instance is running.
    /// From inside one of its own callbacks this returns straight away.
    fn update_callbacks(
        &self,
        handle: InstanceHandle,
        update: impl FnOnce(&mut Callbacks),
    ) -> Result<(), ShortRangeError> {
        let cell = self.shared.resolve(handle)?;
        let _delivering = cell.delivery.lock();
        update(&mut cell.state.lock().callbacks);
        Ok(())
    }

    /// Current mode of an instance
    pub fn mode(&self, handle: InstanceHandle) -> Result<Mode, ShortRangeError> {
        Ok(self.shared.resolve(handle)?.state.lock().mode)
    }

    /// Transport handle an instance is bound to
    pub fn transport(&self, handle: InstanceHandle) -> Result<TransportHandle, ShortRangeError> {
        Ok(self.shared.resolve(handle)?.state.lock().transport)
    }

    /// BLE role last read by [`ShortRange::check_ble_role`]
    pub fn ble_role(&self, handle: InstanceHandle) -> Result<Option<BleRole>, ShortRangeError> {
        Ok(self.shared.resolve(handle)?.state.lock().ble_role)
    }

    /// Module family of an instance
    pub fn module_type(&self, handle: InstanceHandle) -> Result<ModuleType, ShortRangeError> {
        Ok(self.shared.resolve(handle)?.module)
    }

    /// One connection of an instance
    pub fn connection(
        &self,
        handle: InstanceHandle,
        conn: ConnHandle,
    ) -> Result<Option<Connection>, ShortRangeError> {
        Ok(self
            .shared
            .resolve(handle)?
            .state
            .lock()
            .connections
            .get(conn)
            .cloned())
    }

    /// All connections of an instance
    pub fn connections(&self, handle: InstanceHandle) -> Result<Vec<Connection>, ShortRangeError> {
        Ok(self.shared.resolve(handle)?.state.lock().connections.snapshot())
    }

    /// Take the instance's exchange lock and check `operation` against its mode
    async fn session(&self, handle: InstanceHandle, operation: Operation) -> Result<Session, ShortRangeError> {
        let cell = self.shared.resolve(handle)?;
        let guard = Arc::clone(&cell.exchange).lock_owned().await;
        // The instance may have been removed while we waited
        let cell = self.shared.resolve(handle)?;
        let (mode, transport) = {
            let state = cell.state.lock();
            state.mode.check(operation)?;
            (state.mode, state.transport)
        };
        let at = AtBinding::new(
            Arc::clone(&self.shared.at),
            transport,
            self.shared.config.command_timeout(),
        );
        Ok(Session {
            cell,
            at,
            mode,
            _exchange: guard,
        })
    }

    /// Check that the module answers commands
    pub async fn attention(&self, handle: InstanceHandle) -> Result<(), ShortRangeError> {
        let session = self.session(handle, Operation::Attention).await?;
        session.at.exchange(&AtCommand::Attention).await?;
        Ok(())
    }

    /// Write the driver's module configuration and restart the module.
    ///
    /// Blocks for up to the module's boot time (about 500 ms). The restart
    /// drops every SPS link: each connection is closed and a disconnected
    /// status is reported for it.
    pub async fn configure(&self, handle: InstanceHandle) -> Result<(), ShortRangeError> {
        let session = self.session(handle, Operation::Configure).await?;
        let role = self.shared.config.ble_role;
        let profile = session.cell.module.profile();
        info!(
            "Configuring instance {} ({}) as {:?}",
            session.cell.handle, profile.name, role
        );

        for command in [
            AtCommand::EchoOff,
            AtCommand::WriteBleRole(role),
            AtCommand::StoreConfig,
            AtCommand::Restart,
        ] {
            session.at.exchange(&command).await?;
        }

        let dropped = session.cell.state.lock().connections.mark_all_disconnected();
        for conn in dropped {
            debug!("Connection {} dropped by restart", conn);
            self.shared.post_local(handle, conn);
        }

        tokio::time::sleep(profile.boot_time).await;
        let mut last_err = None;
        for attempt in 1..=self.shared.config.boot_attempts {
            match session.at.exchange(&AtCommand::Attention).await {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    debug!("Attention after restart failed (attempt {}): {}", attempt, err);
                    last_err = Some(err);
                }
            }
        }
        if let Some(err) = last_err {
            warn!("Instance {} did not come back after restart", handle);
            return Err(err.into());
        }

        session.cell.state.lock().ble_role = Some(role);
        Ok(())
    }

    /// Read the module's BLE role
    pub async fn check_ble_role(&self, handle: InstanceHandle) -> Result<BleRole, ShortRangeError> {
        let session = self.session(handle, Operation::CheckBleRole).await?;
        let command = AtCommand::ReadBleRole;
        let response = session.at.exchange(&command).await?;
        let prefix = command.response_prefix().unwrap_or_default();
        let value = response.int_value(prefix)?;
        let role = u8::try_from(value)
            .ok()
            .and_then(BleRole::from_number)
            .ok_or_else(|| AtClientError::InvalidResponse(format!("BLE role {}", value)))?;

        session.cell.state.lock().ble_role = Some(role);
        Ok(role)
    }

    /// Switch to data mode.
    ///
    /// The bound transport handle stops accepting commands. Payload must not
    /// be sent before the returned [`ModeChange::ready_at`].
    pub async fn enter_data_mode(&self, handle: InstanceHandle) -> Result<ModeChange, ShortRangeError> {
        self.enter_stream_mode(handle, Operation::EnterDataMode, AtCommand::EnterDataMode)
            .await
    }

    /// Switch to extended data mode; traffic is framed from here on.
    ///
    /// Leaving extended data mode goes through
    /// [`ShortRange::enter_command_mode`]. Payload must not be sent before
    /// the returned [`ModeChange::ready_at`].
    pub async fn enter_extended_data_mode(
        &self,
        handle: InstanceHandle,
    ) -> Result<ModeChange, ShortRangeError> {
        self.enter_stream_mode(
            handle,
            Operation::EnterExtendedDataMode,
            AtCommand::EnterExtendedDataMode,
        )
        .await
    }

    async fn enter_stream_mode(
        &self,
        handle: InstanceHandle,
        operation: Operation,
        command: AtCommand,
    ) -> Result<ModeChange, ShortRangeError> {
        let session = self.session(handle, operation).await?;
        let target = session.mode.after(operation);
        if target == Mode::ExtendedData && !session.cell.module.profile().supports_edm {
            return Err(ShortRangeError::ValueOutOfRange(format!(
                "{} has no extended data mode",
                session.cell.module
            )));
        }

        session.at.exchange(&command).await?;
        // The module has switched; a failed detach only leaves the client parsing noise.
        if let Err(err) = session.at.detach().await {
            warn!("Detaching {} failed: {}", session.at.transport(), err);
        }

        let change = ModeChange::new(target, self.shared.config.settle());
        {
            let mut state = session.cell.state.lock();
            state.mode = target;
            state.ready_at = Some(change.ready_at);
        }
        info!("Instance {} entered {} mode", handle, target);
        Ok(change)
    }

    /// Return to command mode with the escape sequence.
    ///
    /// Usable from any mode; it is also the recovery path when the module
    /// does not answer [`ShortRange::attention`]. Best effort and bounded by
    /// the recovery timeout. On success the instance is rebound to the
    /// returned transport handle and the previous one is dead.
    ///
    /// If the escape times out nothing changes. If the client hands out a
    /// fresh transport but the module then fails `AT`, the instance is still
    /// rebound (the client has retired the old handle) while its mode stays
    /// as it was, so the call can simply be retried.
    pub async fn enter_command_mode(&self, handle: InstanceHandle) -> Result<TransportHandle, ShortRangeError> {
        let session = self.session(handle, Operation::EnterCommandMode).await?;
        let guard = self.shared.config.escape_guard();

        let escape = async {
            tokio::time::sleep(guard).await;
            session.at.write(ESCAPE_SEQUENCE).await?;
            tokio::time::sleep(guard).await;
            session.at.reattach().await
        };
        let fresh = tokio::time::timeout(self.shared.config.recovery_timeout(), escape)
            .await
            .map_err(|_| AtClientError::Timeout(self.shared.config.recovery_timeout_ms))??;

        let old = session.at.transport();
        let new = fresh.transport();
        if let Some(registry) = self.shared.registry.write().as_mut() {
            registry.rebind(handle, old, new)?;
        }
        session.cell.state.lock().transport = new;

        if let Err(err) = fresh.exchange(&AtCommand::Attention).await {
            warn!(
                "Instance {} rebound to {} but module is not answering: {}",
                handle, new, err
            );
            return Err(err.into());
        }

        {
            let mut state = session.cell.state.lock();
            state.mode = Mode::Command;
            state.ready_at = None;
        }
        info!("Instance {} back in command mode on {}", handle, new);
        Ok(new)
    }

    /// Request an SPS link to `address`.
    ///
    /// Success means the module accepted the request; the link is up once
    /// the SPS status callback reports it connected for the returned handle.
    pub async fn connect_sps(&self, handle: InstanceHandle, address: &str) -> Result<ConnHandle, ShortRangeError> {
        let session = self.session(handle, Operation::ConnectSps).await?;
        let address = BtAddress::parse(address)?;
        if !session.cell.state.lock().connections.has_free_slot() {
            return Err(ShortRangeError::NoResources("connection"));
        }

        let command = AtCommand::ConnectSps(address);
        let response = session.at.exchange(&command).await?;
        let peer = response.int_value(command.response_prefix().unwrap_or_default())?;

        let opened = session.cell.state.lock().connections.open(peer, address);
        match opened {
            Ok(conn) => {
                info!("Instance {} connecting to {} as connection {}", handle, address, conn);
                Ok(conn)
            }
            Err(err) => {
                // Every slot was taken by inbound links while we waited
                if let Err(close_err) = session.at.exchange(&AtCommand::ClosePeer(peer)).await {
                    warn!("Closing surplus link {} failed: {}", peer, close_err);
                }
                Err(err)
            }
        }
    }

    /// Close a connection. Unknown or already closed connections succeed
    /// without doing anything. The SPS status callback reports the
    /// disconnection once the connection has been reaped.
    pub async fn disconnect(&self, handle: InstanceHandle, conn: ConnHandle) -> Result<(), ShortRangeError> {
        let session = self.session(handle, Operation::Disconnect).await?;
        let peer = match session.cell.state.lock().connections.get(conn) {
            Some(c) if c.status != ConnectionStatus::Disconnected => c.peer,
            _ => {
                debug!("Connection {} already gone", conn);
                return Ok(());
            }
        };

        session.at.exchange(&AtCommand::ClosePeer(peer)).await?;

        if session.cell.state.lock().connections.mark_disconnected(conn, peer) {
            self.shared.post_local(handle, conn);
        }
        Ok(())
    }

    /// Send payload.
    ///
    /// In command mode the payload goes through an AT write addressed to
    /// `conn`, which must be connected. In data mode `conn` is ignored and
    /// bytes go straight onto the stream. In extended data mode they are
    /// framed for `conn`'s channel, taken to be its module peer handle.
    pub async fn send(&self, handle: InstanceHandle, conn: ConnHandle, data: &[u8]) -> Result<(), ShortRangeError> {
        let session = self.session(handle, Operation::Send).await?;
        let (peer, ready_at) = {
            let state = session.cell.state.lock();
            (connected_peer(&state, conn), state.ready_at)
        };

        if session.mode.is_streaming() {
            if let Some(ready_at) = ready_at {
                let now = Instant::now();
                if now < ready_at {
                    return Err(ShortRangeError::NotReady {
                        remaining: ready_at - now,
                    });
                }
            }
        }

        match session.mode {
            Mode::Command => {
                if data.len() > MAX_AT_PAYLOAD {
                    return Err(ShortRangeError::ValueOutOfRange(format!(
                        "{} bytes exceeds {} per command",
                        data.len(),
                        MAX_AT_PAYLOAD
                    )));
                }
                let command = AtCommand::WriteData {
                    peer: peer?,
                    payload: data.to_vec(),
                };
                session.at.exchange(&command).await?;
            }
            Mode::Data => {
                session.at.write(data).await?;
            }
            Mode::ExtendedData => {
                // EDM channel ids follow the module's peer handles
                let channel = u8::try_from(peer?).map_err(|_| {
                    ShortRangeError::ValueOutOfRange(format!("channel for connection {}", conn))
                })?;
                let frames = edm::data_frames(channel, data)
                    .map_err(|err| ShortRangeError::ValueOutOfRange(err.to_string()))?;
                for frame in frames {
                    session.at.write(&frame).await?;
                }
            }
        }
        debug!("Instance {} sent {} bytes in {} mode", handle, data.len(), session.mode);
        Ok(())
    }
}

/// Peer handle of `conn` if it can carry data
fn connected_peer(state: &InstanceState, conn: ConnHandle) -> Result<i32, ShortRangeError> {
    match state.connections.get(conn) {
        Some(c) if c.status == ConnectionStatus::Connected => Ok(c.peer),
        Some(c) => Err(ShortRangeError::ConnectionNotReady {
            conn,
            status: c.status,
        }),
        None => Err(ShortRangeError::ConnectionNotReady {
            conn,
            status: ConnectionStatus::Disconnected,
        }),
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}
