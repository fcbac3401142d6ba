//! Scripted AT client standing in for a module on the other end of a UART.

#![allow(dead_code)]

use async_trait::async_trait;
use short_range::{
    AtClient, AtClientError, AtCommand, AtResponse, DriverConfig, EventSink, ShortRange,
    TransportHandle,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct ModuleState {
    next_transport: u32,
    attached: HashSet<TransportHandle>,
    next_peer: i32,
    /// Link number every connect answers with, as modules reissue freed ones
    reused_peer: Option<i32>,
    ble_role: String,
    commands: Vec<(TransportHandle, String)>,
    written: Vec<(TransportHandle, Vec<u8>)>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
}

/// Fake module: answers `OK` to everything unless told otherwise
pub struct MockModule {
    state: Mutex<ModuleState>,
}

impl MockModule {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ModuleState {
                next_transport: 100,
                next_peer: 1,
                ble_role: "2".to_string(),
                ..Default::default()
            }),
        })
    }

    /// Create a command-mode transport handle, as the caller of `add` would
    pub fn open(&self, raw: u32) -> TransportHandle {
        let handle = TransportHandle(raw);
        self.state.lock().unwrap().attached.insert(handle);
        handle
    }

    /// Make `command` answer `ERROR`
    pub fn fail(&self, command: &str) {
        self.state.lock().unwrap().failing.insert(command.to_string());
    }

    /// Let `command` answer normally again
    pub fn heal(&self, command: &str) {
        self.state.lock().unwrap().failing.remove(command);
    }

    /// Answer every connect with the same link number
    pub fn reuse_peer(&self, peer: i32) {
        self.state.lock().unwrap().reused_peer = Some(peer);
    }

    /// Make `command` never answer
    pub fn hang(&self, command: &str) {
        self.state.lock().unwrap().hanging.insert(command.to_string());
    }

    pub fn set_ble_role(&self, value: &str) {
        self.state.lock().unwrap().ble_role = value.to_string();
    }

    /// Commands received so far, as text
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn commands_on(&self, transport: TransportHandle) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(t, _)| *t == transport)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Raw bytes written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .written
            .iter()
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn is_attached(&self, transport: TransportHandle) -> bool {
        self.state.lock().unwrap().attached.contains(&transport)
    }
}

#[async_trait]
impl AtClient for MockModule {
    async fn exchange(
        &self,
        transport: TransportHandle,
        command: &AtCommand,
    ) -> Result<AtResponse, AtClientError> {
        let text = command.to_string();
        let hang = {
            let mut state = self.state.lock().unwrap();
            if !state.attached.contains(&transport) {
                return Err(AtClientError::Detached(transport));
            }
            state.commands.push((transport, text.clone()));
            if state.failing.contains(&text) {
                return Err(AtClientError::ErrorResult(text));
            }
            state.hanging.contains(&text)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let response = match command {
            AtCommand::ReadBleRole => AtResponse::line(format!("+UBTLE:{}", state.ble_role)),
            AtCommand::ConnectSps(_) => {
                let peer = match state.reused_peer {
                    Some(peer) => peer,
                    None => {
                        state.next_peer += 1;
                        state.next_peer - 1
                    }
                };
                AtResponse::line(format!("+UDCP:{}", peer))
            }
            _ => AtResponse::ok(),
        };
        Ok(response)
    }

    async fn write(&self, transport: TransportHandle, bytes: &[u8]) -> Result<(), AtClientError> {
        self.state
            .lock()
            .unwrap()
            .written
            .push((transport, bytes.to_vec()));
        Ok(())
    }

    async fn detach(&self, transport: TransportHandle) -> Result<(), AtClientError> {
        self.state.lock().unwrap().attached.remove(&transport);
        Ok(())
    }

    async fn reattach(&self, transport: TransportHandle) -> Result<TransportHandle, AtClientError> {
        let mut state = self.state.lock().unwrap();
        state.attached.remove(&transport);
        let fresh = TransportHandle(state.next_transport);
        state.next_transport += 1;
        state.attached.insert(fresh);
        Ok(fresh)
    }
}

/// An initialised driver over a fresh mock module
pub async fn driver() -> (ShortRange, Arc<MockModule>, EventSink) {
    driver_with(DriverConfig::default()).await
}

pub async fn driver_with(config: DriverConfig) -> (ShortRange, Arc<MockModule>, EventSink) {
    let module = MockModule::new();
    let driver = ShortRange::with_config(module.clone(), config);
    driver.init().await.unwrap();
    let sink = driver.event_sink();
    (driver, module, sink)
}

/// Forward every callback invocation into a channel
pub fn recorder<E: Clone + Send + 'static>() -> (
    impl Fn(short_range::InstanceHandle, &E) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<E>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |_: short_range::InstanceHandle, event: &E| {
        let _ = tx.send(event.clone());
    };
    (callback, rx)
}

/// Next recorded event, failing the test if none arrives soon
pub async fn next<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event delivered")
        .expect("callback dropped")
}

/// Let the dispatcher drain, then check nothing was recorded
pub async fn assert_quiet<E: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<E>) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(rx.try_recv().is_err(), "unexpected event delivered");
}
