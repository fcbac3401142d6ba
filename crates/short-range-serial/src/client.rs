//! Serial AT Client
//!
//! Line-oriented command/response over a byte stream, usually a UART opened
//! through `tokio-serial`. One reader task per stream splits incoming bytes
//! into response lines and URCs while the module is in command mode, and
//! into raw or framed payload once it has left it. URCs and payload are
//! posted to the driver's [`EventSink`]; response lines wait for the
//! exchange in progress.

use crate::error::SerialError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use short_range::edm::{EdmError, EdmPacket};
use short_range::{
    urc, AtClient, AtClientError, AtCommand, AtResponse, EventSink, ModuleEvent,
    TransportHandle, AT_BUFFER_LENGTH_BYTES,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

const EDM_START: u8 = 0xAA;

/// How the reader interprets incoming bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    Command,
    Data,
    ExtendedData,
}

struct StreamState {
    handle: TransportHandle,
    mode: StreamMode,
    /// Cleared by `detach`, set again by `reattach`
    attached: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedSink = Arc<RwLock<Option<EventSink>>>;

/// One attached byte stream
struct Stream {
    state: Mutex<StreamState>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    fn accepts_commands(&self, transport: TransportHandle) -> bool {
        let state = self.state.lock();
        state.handle == transport && state.attached
    }

    fn set_mode(&self, mode: StreamMode) {
        self.state.lock().mode = mode;
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), AtClientError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}

/// AT client over serial ports and other byte streams
pub struct SerialAtClient {
    streams: RwLock<HashMap<TransportHandle, Arc<Stream>>>,
    next_handle: AtomicU32,
    sink: SharedSink,
}

impl SerialAtClient {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Route URCs and payload into `sink` from now on
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.write() = Some(sink);
    }

    /// Open a serial device and attach it in command mode
    pub fn open(&self, path: &str, baud_rate: u32) -> Result<TransportHandle, SerialError> {
        let port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|source| SerialError::Open {
                path: path.to_string(),
                source,
            })?;
        let handle = self.attach(port);
        info!("Opened {} at {} baud as {}", path, baud_rate, handle);
        Ok(handle)
    }

    /// Attach any byte stream in command mode. Must run inside a Tokio runtime.
    pub fn attach<S>(&self, io: S) -> TransportHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let handle = self.allocate_handle();
        let stream = Arc::new(Stream {
            state: Mutex::new(StreamState {
                handle,
                mode: StreamMode::Command,
                attached: true,
            }),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            responses: tokio::sync::Mutex::new(lines_rx),
            reader: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&stream),
            lines_tx,
            Arc::clone(&self.sink),
        ));
        *stream.reader.lock() = Some(task);
        self.streams.write().insert(handle, stream);
        handle
    }

    /// Stop reading a stream and forget its handle
    pub fn close(&self, transport: TransportHandle) {
        if let Some(stream) = self.streams.write().remove(&transport) {
            stream.stop();
            debug!("Closed {}", transport);
        }
    }

    fn allocate_handle(&self) -> TransportHandle {
        TransportHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn stream(&self, transport: TransportHandle) -> Result<Arc<Stream>, AtClientError> {
        self.streams
            .read()
            .get(&transport)
            .cloned()
            .ok_or(AtClientError::Detached(transport))
    }
}

impl Default for SerialAtClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialAtClient {
    fn drop(&mut self) {
        for stream in self.streams.get_mut().values() {
            stream.stop();
        }
    }
}

#[async_trait]
impl AtClient for SerialAtClient {
    async fn exchange(
        &self,
        transport: TransportHandle,
        command: &AtCommand,
    ) -> Result<AtResponse, AtClientError> {
        let stream = self.stream(transport)?;
        if !stream.accepts_commands(transport) {
            return Err(AtClientError::Detached(transport));
        }

        let mut responses = stream.responses.lock().await;
        // Lines left over from an abandoned exchange or a restart banner
        while let Ok(stale) = responses.try_recv() {
            debug!("{} discarding {:?}", transport, stale);
        }

        let text = command.to_string();
        stream.write_all(format!("{}\r", text).as_bytes()).await?;

        let mut lines = Vec::new();
        loop {
            let line = responses
                .recv()
                .await
                .ok_or_else(|| AtClientError::Io(format!("{} closed", transport)))?;
            match line.as_str() {
                "OK" => break,
                "ERROR" => return Err(AtClientError::ErrorResult(text)),
                l if l.starts_with("+CME ERROR") => return Err(AtClientError::ErrorResult(text)),
                // Echo, until echo is switched off
                l if l == text => continue,
                _ => lines.push(line),
            }
        }

        match command {
            AtCommand::EnterDataMode => stream.set_mode(StreamMode::Data),
            AtCommand::EnterExtendedDataMode => stream.set_mode(StreamMode::ExtendedData),
            _ => {}
        }
        Ok(AtResponse { lines })
    }

    async fn write(&self, transport: TransportHandle, bytes: &[u8]) -> Result<(), AtClientError> {
        self.stream(transport)?.write_all(bytes).await
    }

    async fn detach(&self, transport: TransportHandle) -> Result<(), AtClientError> {
        self.stream(transport)?.state.lock().attached = false;
        debug!("{} detached from command parsing", transport);
        Ok(())
    }

    async fn reattach(&self, transport: TransportHandle) -> Result<TransportHandle, AtClientError> {
        let fresh = self.allocate_handle();
        let mut streams = self.streams.write();
        let stream = streams
            .remove(&transport)
            .ok_or(AtClientError::Detached(transport))?;
        {
            let mut state = stream.state.lock();
            state.handle = fresh;
            state.mode = StreamMode::Command;
            state.attached = true;
        }
        streams.insert(fresh, stream);
        debug!("{} reattached as {}", transport, fresh);
        Ok(fresh)
    }
}

async fn read_loop<R>(
    mut reader: R,
    stream: Arc<Stream>,
    lines: mpsc::UnboundedSender<String>,
    sink: SharedSink,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; AT_BUFFER_LENGTH_BYTES];
    let mut pending = Vec::new();
    let mut last_mode = StreamMode::Command;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("Serial stream closed");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                warn!("Serial read failed: {}", err);
                break;
            }
        };

        let (handle, mode) = {
            let state = stream.state.lock();
            (state.handle, state.mode)
        };
        if mode != last_mode {
            // Partial input from the previous mode cannot be completed
            pending.clear();
            last_mode = mode;
        }
        pending.extend_from_slice(&chunk[..n]);

        let events = match mode {
            StreamMode::Command => {
                let mut events = Vec::new();
                for line in take_lines(&mut pending) {
                    if urc::is_urc(&line) {
                        events.extend(urc::parse(&line));
                    } else if lines.send(line).is_err() {
                        return;
                    }
                }
                events
            }
            StreamMode::Data => vec![ModuleEvent::Data {
                peer: None,
                payload: std::mem::take(&mut pending),
            }],
            StreamMode::ExtendedData => take_frames(&mut pending)
                .into_iter()
                .filter_map(frame_event)
                .collect(),
        };

        if events.is_empty() {
            continue;
        }
        let Some(target) = sink.read().clone() else {
            debug!("No event sink, dropping {} events from {}", events.len(), handle);
            continue;
        };
        for event in events {
            target.post(handle, event);
        }
    }
}

/// Remove complete lines from the front of `buf`
fn take_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(end) = buf.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Remove complete EDM frames from the front of `buf`, skipping noise
fn take_frames(buf: &mut Vec<u8>) -> Vec<EdmPacket> {
    let mut packets = Vec::new();
    loop {
        match EdmPacket::decode(buf) {
            Ok((packet, used)) => {
                buf.drain(..used);
                packets.push(packet);
            }
            Err(EdmError::Incomplete(_)) => break,
            Err(err) => {
                debug!("Resyncing EDM stream: {}", err);
                let skip = buf
                    .iter()
                    .skip(1)
                    .position(|&b| b == EDM_START)
                    .map_or(buf.len(), |p| p + 1);
                buf.drain(..skip);
            }
        }
    }
    packets
}

/// Turn an EDM packet into a module event.
///
/// The channel id is reported as the SPS link number. That holds for modules
/// that number EDM channels after their AT peer handles; a module with a
/// separate channel space would need the mapping learned from its connect
/// events, which this client does not do.
fn frame_event(packet: EdmPacket) -> Option<ModuleEvent> {
    match packet {
        EdmPacket::DataEvent { channel, data } => Some(ModuleEvent::Data {
            peer: Some(i32::from(channel)),
            payload: data,
        }),
        EdmPacket::AtEvent(line) => urc::parse(&String::from_utf8_lossy(&line)),
        other => {
            debug!("Ignoring EDM packet {:?}", other);
            None
        }
    }
}
