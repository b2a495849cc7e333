//! QUIC engine binding.
//!
//! The engine is driven sans-IO: datagrams from the lower transport go in
//! through [`QuicEngine::handle_datagram`], packets to send come out of
//! [`QuicEngine::poll_transmit`], and connection/stream notifications come
//! out of [`QuicEngine::poll_event`]. The transport owns the loop; the engine
//! never calls back into it.

use crate::config::{QuicSettings, Role};
use crate::error::{TransportError, TransportResult};
use crate::quic::tls::{self, Identity};
use bytes::{Bytes, BytesMut};
use quinn_proto::{
    ClientConfig, Connection, ConnectionError, ConnectionHandle, DatagramEvent, Dir, Endpoint,
    EndpointConfig, EndpointEvent, Event, ReadError, ReadableError, StreamEvent, StreamId, VarInt, WriteError,
};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque engine handle for one native stream.
pub type NativeStreamId = u64;

/// Peer address handed to the engine.
///
/// The lower transport is an opaque pipe, so there is exactly one peer and
/// its real address is never known at this layer.
pub const PLACEHOLDER_PEER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);

/// Application close code for an orderly shutdown.
const CLOSE_CODE_NORMAL: u32 = 0;

/// Application close code when the handshake deadline passes.
const CLOSE_CODE_HANDSHAKE_TIMEOUT: u32 = 1;

/// Notifications produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A native connection exists (client: connect issued, server: peer accepted).
    NewConnection,
    /// Handshake completed.
    Connected,
    HandshakeFailed(String),
    ConnectionClosed { reason: String, error: bool },
    /// The peer opened a stream.
    StreamOpened(NativeStreamId),
    StreamReadable(NativeStreamId),
    /// The peer stopped reading a stream.
    StreamStopped(NativeStreamId),
}

/// How a stream's receive side ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Finished,
    Reset(u64),
}

/// Result of draining a stream's readable bytes.
#[derive(Debug, Default)]
pub struct StreamRead {
    pub data: BytesMut,
    pub end: Option<StreamEnd>,
}

/// The protocol engine seen by [`QuicTransport`](crate::quic::QuicTransport).
pub trait QuicEngine: Send + 'static {
    /// Begin the handshake. Servers wait for the first datagram instead.
    fn connect(&mut self, now: Instant) -> TransportResult<()>;

    fn handle_datagram(&mut self, now: Instant, data: &[u8]);

    fn handle_timeout(&mut self, now: Instant);

    /// Next instant [`handle_timeout`](Self::handle_timeout) must run.
    fn poll_timeout(&mut self) -> Option<Instant>;

    /// Next packet for the lower transport.
    fn poll_transmit(&mut self, now: Instant) -> Option<Bytes>;

    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// Open a bidirectional stream. `None` without a connection or when the
    /// peer's stream limit is reached.
    fn open_stream(&mut self) -> Option<NativeStreamId>;

    /// Write as much of `data` as flow control allows. `Ok(0)` means blocked.
    fn write_stream(&mut self, stream: NativeStreamId, data: &[u8]) -> TransportResult<usize>;

    /// Drain every readable byte from a stream.
    fn read_stream(&mut self, stream: NativeStreamId) -> StreamRead;

    /// Finish the send side, stop the receive side and forget the handle.
    fn close_stream(&mut self, stream: NativeStreamId);

    /// Abort both directions and forget the handle.
    fn reset_stream(&mut self, stream: NativeStreamId, code: u64);

    fn close(&mut self, now: Instant, reason: &str);

    fn rtt(&self) -> Option<Duration>;

    fn has_connection(&self) -> bool;
}

/// Bidirectional native handle table.
#[derive(Debug, Default)]
struct StreamTable {
    next: NativeStreamId,
    by_handle: HashMap<NativeStreamId, StreamId>,
    by_stream: HashMap<StreamId, NativeStreamId>,
}

impl StreamTable {
    fn insert(&mut self, stream: StreamId) -> NativeStreamId {
        if let Some(handle) = self.by_stream.get(&stream) {
            return *handle;
        }
        let handle = self.next;
        self.next += 1;
        self.by_handle.insert(handle, stream);
        self.by_stream.insert(stream, handle);
        handle
    }

    fn stream(&self, handle: NativeStreamId) -> Option<StreamId> {
        self.by_handle.get(&handle).copied()
    }

    fn handle(&self, stream: StreamId) -> Option<NativeStreamId> {
        self.by_stream.get(&stream).copied()
    }

    fn remove(&mut self, handle: NativeStreamId) -> Option<StreamId> {
        let stream = self.by_handle.remove(&handle)?;
        self.by_stream.remove(&stream);
        Some(stream)
    }

    fn clear(&mut self) {
        self.by_handle.clear();
        self.by_stream.clear();
    }
}

/// [`QuicEngine`] on top of `quinn-proto`.
pub struct QuinnEngine {
    role: Role,
    endpoint: Endpoint,
    client_config: Option<ClientConfig>,
    server_name: String,
    conn: Option<(ConnectionHandle, Connection)>,
    streams: StreamTable,
    events: VecDeque<EngineEvent>,
    /// Endpoint-level responses (version negotiation, refusals).
    transmits: VecDeque<Bytes>,
    handshake_timeout: Duration,
    handshake_deadline: Option<Instant>,
    connected: bool,
    /// Set once a close or loss has been reported; later losses are ignored.
    lost: bool,
    buf: Vec<u8>,
}

impl QuinnEngine {
    /// Build the engine for `settings.role`.
    ///
    /// Servers use `settings.identity`, generating one when absent.
    pub fn new(settings: &QuicSettings) -> TransportResult<Self> {
        let (server_config, client_config) = match settings.role {
            Role::Server => {
                let identity = match &settings.identity {
                    Some(identity) => identity.clone(),
                    None => Identity::generate_default()?,
                };
                log::info!("QUIC server certificate fingerprint: {}", identity.fingerprint());
                (Some(Arc::new(tls::server_config(settings, &identity)?)), None)
            }
            Role::Client => (None, Some(tls::client_config(settings)?)),
        };

        if !settings.support_tcid0 || !settings.support_nstp || !settings.delayed_acks {
            log::debug!("Legacy engine flags (tcid0/nstp/delayed_acks) have no effect");
        }

        let endpoint = Endpoint::new(
            Arc::new(EndpointConfig::default()),
            server_config,
            false,
            None,
        );

        Ok(Self {
            role: settings.role,
            endpoint,
            client_config,
            server_name: settings.server_name.clone(),
            conn: None,
            streams: StreamTable::default(),
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            handshake_timeout: settings.handshake_timeout,
            handshake_deadline: None,
            connected: false,
            lost: false,
            buf: Vec::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn install(&mut self, now: Instant, handle: ConnectionHandle, connection: Connection) {
        self.conn = Some((handle, connection));
        self.streams.clear();
        self.connected = false;
        self.lost = false;
        self.handshake_deadline = Some(now + self.handshake_timeout);
        self.events.push_back(EngineEvent::NewConnection);
    }

    /// Drop a closed or lost connection so a new one can take its place.
    fn discard(&mut self) {
        if let Some((handle, _)) = self.conn.take() {
            log::debug!("Discarding previous QUIC connection");
            self.endpoint.handle_event(handle, EndpointEvent::drained());
        }
        self.streams.clear();
        self.connected = false;
        self.handshake_deadline = None;
    }

    fn report_lost(&mut self, reason: ConnectionError) {
        if self.lost {
            return;
        }
        self.lost = true;
        self.handshake_deadline = None;
        if self.connected {
            self.connected = false;
            let error = !matches!(
                reason,
                ConnectionError::ApplicationClosed(_)
                    | ConnectionError::ConnectionClosed(_)
                    | ConnectionError::LocallyClosed
            );
            log::info!("QUIC connection closed: {}", reason);
            self.events.push_back(EngineEvent::ConnectionClosed {
                reason: reason.to_string(),
                error,
            });
        } else {
            log::warn!("QUIC handshake failed: {}", reason);
            self.events
                .push_back(EngineEvent::HandshakeFailed(reason.to_string()));
        }
    }

    /// Move connection state into the event queue and endpoint.
    fn pump(&mut self) {
        let mut drained = false;
        let mut lost = None;
        {
            let Self {
                endpoint,
                conn,
                streams,
                events,
                connected,
                handshake_deadline,
                ..
            } = self;
            let Some((handle, connection)) = conn.as_mut() else {
                return;
            };

            while let Some(event) = connection.poll_endpoint_events() {
                if event.is_drained() {
                    drained = true;
                }
                if let Some(event) = endpoint.handle_event(*handle, event) {
                    connection.handle_event(event);
                }
            }

            while let Some(event) = connection.poll() {
                match event {
                    Event::Connected => {
                        *connected = true;
                        *handshake_deadline = None;
                        log::info!("QUIC handshake complete");
                        events.push_back(EngineEvent::Connected);
                    }
                    Event::ConnectionLost { reason } => lost = Some(reason),
                    Event::Stream(StreamEvent::Opened { dir: Dir::Bi }) => {
                        while let Some(stream) = connection.streams().accept(Dir::Bi) {
                            let native = streams.insert(stream);
                            events.push_back(EngineEvent::StreamOpened(native));
                        }
                    }
                    Event::Stream(StreamEvent::Readable { id }) => {
                        if let Some(native) = streams.handle(id) {
                            events.push_back(EngineEvent::StreamReadable(native));
                        }
                    }
                    // Blocked writes are retried after every pump.
                    Event::Stream(StreamEvent::Writable { .. }) => {}
                    Event::Stream(StreamEvent::Stopped { id, .. }) => {
                        if let Some(native) = streams.handle(id) {
                            events.push_back(EngineEvent::StreamStopped(native));
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(reason) = lost {
            self.report_lost(reason);
        }
        if drained {
            log::debug!("QUIC connection drained");
            self.conn = None;
            self.streams.clear();
        }
    }
}

impl QuicEngine for QuinnEngine {
    fn connect(&mut self, now: Instant) -> TransportResult<()> {
        if self.has_connection() {
            return Ok(());
        }
        self.discard();
        // Events from the old connection belong to the previous session.
        self.events.clear();
        let Some(config) = self.client_config.clone() else {
            log::debug!("QUIC server waiting for client handshake");
            return Ok(());
        };
        let (handle, connection) = self
            .endpoint
            .connect(now, config, PLACEHOLDER_PEER, &self.server_name)
            .map_err(|e| TransportError::Engine(format!("Failed to connect: {}", e)))?;
        self.install(now, handle, connection);
        self.pump();
        Ok(())
    }

    fn handle_datagram(&mut self, now: Instant, data: &[u8]) {
        self.buf.clear();
        let event = self.endpoint.handle(
            now,
            PLACEHOLDER_PEER,
            None,
            None,
            BytesMut::from(data),
            &mut self.buf,
        );
        match event {
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                if let Some((current, connection)) = self.conn.as_mut() {
                    if *current == handle {
                        connection.handle_event(event);
                    }
                }
            }
            Some(DatagramEvent::NewConnection(incoming)) => {
                if self.has_connection() {
                    log::warn!("Refusing second QUIC connection on this transport");
                    self.buf.clear();
                    let transmit = self.endpoint.refuse(incoming, &mut self.buf);
                    self.transmits
                        .push_back(Bytes::copy_from_slice(&self.buf[..transmit.size]));
                    return;
                }
                self.discard();
                self.buf.clear();
                match self.endpoint.accept(incoming, now, &mut self.buf, None) {
                    Ok((handle, connection)) => {
                        log::debug!("QUIC server accepted connection");
                        self.install(now, handle, connection);
                    }
                    Err(err) => {
                        log::warn!("Failed to accept QUIC connection: {}", err.cause);
                        if let Some(transmit) = err.response {
                            self.transmits
                                .push_back(Bytes::copy_from_slice(&self.buf[..transmit.size]));
                        }
                    }
                }
            }
            Some(DatagramEvent::Response(transmit)) => {
                self.transmits
                    .push_back(Bytes::copy_from_slice(&self.buf[..transmit.size]));
            }
            None => {}
        }
        self.pump();
    }

    fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline && !self.connected {
                if let Some((_, connection)) = self.conn.as_mut() {
                    connection.close(
                        now,
                        VarInt::from_u32(CLOSE_CODE_HANDSHAKE_TIMEOUT),
                        Bytes::from_static(b"handshake timeout"),
                    );
                }
                self.handshake_deadline = None;
                if !self.lost {
                    self.lost = true;
                    log::warn!("QUIC handshake timed out after {:?}", self.handshake_timeout);
                    self.events
                        .push_back(EngineEvent::HandshakeFailed("handshake timed out".into()));
                }
            }
        }
        if let Some((_, connection)) = self.conn.as_mut() {
            connection.handle_timeout(now);
        }
        self.pump();
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        let engine = self
            .conn
            .as_mut()
            .and_then(|(_, connection)| connection.poll_timeout());
        match (engine, self.handshake_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        if let Some(packet) = self.transmits.pop_front() {
            return Some(packet);
        }
        let (_, connection) = self.conn.as_mut()?;
        self.buf.clear();
        let transmit = connection.poll_transmit(now, 1, &mut self.buf)?;
        Some(Bytes::copy_from_slice(&self.buf[..transmit.size]))
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.pump();
        self.events.pop_front()
    }

    fn open_stream(&mut self) -> Option<NativeStreamId> {
        if !self.connected {
            return None;
        }
        let (_, connection) = self.conn.as_mut()?;
        let stream = connection.streams().open(Dir::Bi)?;
        Some(self.streams.insert(stream))
    }

    fn write_stream(&mut self, native: NativeStreamId, data: &[u8]) -> TransportResult<usize> {
        let stream = self
            .streams
            .stream(native)
            .ok_or_else(|| TransportError::Engine(format!("Unknown stream {}", native)))?;
        let (_, connection) = self
            .conn
            .as_mut()
            .ok_or_else(|| TransportError::Engine("No connection".into()))?;
        match connection.send_stream(stream).write(data) {
            Ok(written) => Ok(written),
            Err(WriteError::Blocked) => Ok(0),
            Err(err) => Err(TransportError::Engine(format!(
                "Write on stream {} failed: {}",
                native, err
            ))),
        }
    }

    fn read_stream(&mut self, native: NativeStreamId) -> StreamRead {
        let mut out = StreamRead::default();
        let (Some(stream), Some((_, connection))) = (self.streams.stream(native), self.conn.as_mut())
        else {
            return out;
        };

        let mut recv = connection.recv_stream(stream);
        let mut chunks = match recv.read(true) {
            Ok(chunks) => chunks,
            Err(ReadableError::ClosedStream) => {
                out.end = Some(StreamEnd::Finished);
                return out;
            }
            Err(err) => {
                log::warn!("Stream {} not readable: {}", native, err);
                return out;
            }
        };
        loop {
            match chunks.next(usize::MAX) {
                Ok(Some(chunk)) => out.data.extend_from_slice(&chunk.bytes),
                Ok(None) => {
                    out.end = Some(StreamEnd::Finished);
                    break;
                }
                Err(ReadError::Blocked) => break,
                Err(ReadError::Reset(code)) => {
                    out.end = Some(StreamEnd::Reset(code.into_inner()));
                    break;
                }
            }
        }
        let _ = chunks.finalize();
        out
    }

    fn close_stream(&mut self, native: NativeStreamId) {
        let Some(stream) = self.streams.remove(native) else {
            return;
        };
        if let Some((_, connection)) = self.conn.as_mut() {
            let _ = connection.send_stream(stream).finish();
            let _ = connection
                .recv_stream(stream)
                .stop(VarInt::from_u32(CLOSE_CODE_NORMAL));
        }
    }

    fn reset_stream(&mut self, native: NativeStreamId, code: u64) {
        let Some(stream) = self.streams.remove(native) else {
            return;
        };
        let code = VarInt::from_u64(code).unwrap_or(VarInt::from_u32(CLOSE_CODE_NORMAL));
        if let Some((_, connection)) = self.conn.as_mut() {
            let _ = connection.send_stream(stream).reset(code);
            let _ = connection.recv_stream(stream).stop(code);
        }
    }

    fn close(&mut self, now: Instant, reason: &str) {
        let Some((_, connection)) = self.conn.as_mut() else {
            return;
        };
        connection.close(
            now,
            VarInt::from_u32(CLOSE_CODE_NORMAL),
            Bytes::copy_from_slice(reason.as_bytes()),
        );
        self.report_lost(ConnectionError::LocallyClosed);
        self.streams.clear();
    }

    fn rtt(&self) -> Option<Duration> {
        match &self.conn {
            Some((_, connection)) if self.connected => Some(connection.rtt()),
            _ => None,
        }
    }

    fn has_connection(&self) -> bool {
        self.conn.is_some() && !self.lost
    }
}

impl std::fmt::Debug for QuinnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuinnEngine")
            .field("role", &self.role)
            .field("has_connection", &self.conn.is_some())
            .field("connected", &self.connected)
            .field("streams", &self.streams.by_handle.len())
            .finish()
    }
}
