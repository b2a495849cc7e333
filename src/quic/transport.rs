//! QUIC transport layer.
//!
//! Sits on top of an opaque datagram pipe and multiplexes data channels
//! onto QUIC streams. All engine work (inbound datagrams, engine events,
//! timers, send-queue drains) runs on the transport's [`Processor`], so it
//! observes one thread at a time no matter which thread triggered it.
//!
//! Lock order: send lock, then engine, then connection context. Upper-layer
//! callbacks and the lower transport are never invoked with the engine or
//! context lock held.

use super::context::ConnectionContext;
use super::engine::{EngineEvent, NativeStreamId, QuicEngine, QuinnEngine, StreamEnd};
use super::frame::{encode_message, DEFAULT_FRAGMENT_SIZE};
use crate::config::{Configuration, QuicSettings};
use crate::error::{TransportError, TransportResult};
use crate::message::{Message, MessageKind};
use crate::processor::{Processor, SingleFlight};
use crate::queue::Queue;
use crate::transport::{
    Callback, MessageCallback, StateCallback, SynchronizedCallback, Transport, TransportBase,
    TransportState,
};
use bytes::{Buf, Bytes};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// `(stream, buffered bytes)` notification.
pub type AmountCallback = Arc<dyn Fn(u16, usize) + Send + Sync>;

/// Stream reset code for malformed framing.
const RESET_CODE_PROTOCOL: u64 = 1;

/// A framed message waiting in the send queue.
#[derive(Debug)]
struct PendingWrite {
    stream: u16,
    /// Payload size counted in the buffered amount.
    accounted: usize,
    /// Frames not yet accepted by the engine.
    frames: Bytes,
    /// Finish and unmap the stream once the frames are written.
    finish: bool,
}

enum WriteOutcome {
    Done,
    Blocked,
    Dropped,
}

/// QUIC transport: engine binding, stream map, send queue and statistics.
pub struct QuicTransport {
    base: TransportBase,
    weak_self: Weak<QuicTransport>,
    runtime: Handle,
    engine: Mutex<Box<dyn QuicEngine>>,
    context: Mutex<ConnectionContext>,

    inbound: Queue<Bytes>,
    send_queue: Queue<PendingWrite>,
    /// Reentrant so a buffered-amount callback may flush from inside a drain.
    send_lock: ReentrantMutex<()>,
    send_shutdown: AtomicBool,

    buffered: Mutex<HashMap<u16, usize>>,
    amount_callback: SynchronizedCallback<(u16, usize)>,

    processor: Processor,
    recv_flight: SingleFlight,
    flush_flight: SingleFlight,
    timeout_flight: SingleFlight,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_notify: Arc<Notify>,

    bytes_sent: AtomicUsize,
    bytes_received: AtomicUsize,
    max_message_size: usize,
    max_streams_out: u64,
}

impl QuicTransport {
    /// Create a transport backed by a `quinn-proto` engine.
    ///
    /// Fails if the engine cannot be created (bad TLS identity or settings)
    /// or if called outside a tokio runtime.
    pub fn new(
        lower: Option<Arc<dyn Transport>>,
        config: &Configuration,
        settings: QuicSettings,
        recv_callback: Option<MessageCallback>,
        amount_callback: Option<AmountCallback>,
        state_callback: Option<StateCallback>,
    ) -> TransportResult<Arc<Self>> {
        let engine = QuinnEngine::new(&settings)?;
        Self::with_engine(
            lower,
            config,
            &settings,
            Box::new(engine),
            recv_callback,
            amount_callback,
            state_callback,
        )
    }

    /// Create a transport around any [`QuicEngine`].
    pub fn with_engine(
        lower: Option<Arc<dyn Transport>>,
        config: &Configuration,
        settings: &QuicSettings,
        engine: Box<dyn QuicEngine>,
        recv_callback: Option<MessageCallback>,
        amount_callback: Option<AmountCallback>,
        state_callback: Option<StateCallback>,
    ) -> TransportResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| {
            TransportError::Runtime(format!("QuicTransport needs a tokio runtime: {}", e))
        })?;
        let max_message_size = config.max_message_size();
        let amount_callback = amount_callback.map(|callback| -> Callback<(u16, usize)> {
            Arc::new(move |(stream, amount): (u16, usize)| callback(stream, amount))
        });

        log::debug!(
            "Creating QUIC transport (max message {} bytes, {} streams out)",
            max_message_size,
            settings.max_streams_out
        );

        Ok(Arc::new_cyclic(|weak_self| {
            let base = TransportBase::new(lower, state_callback);
            base.on_recv(recv_callback);
            Self {
                base,
                weak_self: weak_self.clone(),
                processor: Processor::new(&runtime),
                runtime,
                engine: Mutex::new(engine),
                context: Mutex::new(ConnectionContext::new(max_message_size)),
                inbound: Queue::new(),
                send_queue: Queue::new(),
                send_lock: ReentrantMutex::new(()),
                send_shutdown: AtomicBool::new(false),
                buffered: Mutex::new(HashMap::new()),
                amount_callback: SynchronizedCallback::new(amount_callback),
                recv_flight: SingleFlight::new(),
                flush_flight: SingleFlight::new(),
                timeout_flight: SingleFlight::new(),
                timer: Mutex::new(None),
                timer_notify: Arc::new(Notify::new()),
                bytes_sent: AtomicUsize::new(0),
                bytes_received: AtomicUsize::new(0),
                max_message_size,
                max_streams_out: settings.max_streams_out,
            }
        }))
    }

    pub fn on_buffered_amount(&self, callback: Option<AmountCallback>) {
        self.amount_callback.set(callback.map(|callback| -> Callback<(u16, usize)> {
            Arc::new(move |(stream, amount): (u16, usize)| callback(stream, amount))
        }));
    }

    /// Receive hook for messages reassembled from streams.
    pub fn on_recv(&self, callback: Option<MessageCallback>) {
        self.base.on_recv(callback);
    }

    pub fn on_state_change(&self, callback: Option<StateCallback>) {
        self.base.on_state_change(callback);
    }

    /// Drain the send queue now. Returns true if the queue is empty.
    pub fn flush(&self) -> bool {
        if self.send_queue.is_empty() {
            return true;
        }
        self.try_send_queue()
    }

    /// Close the native connection and move to Disconnected.
    ///
    /// Unlike [`stop`](Transport::stop) the lower transport hook stays
    /// registered.
    pub fn close(&self) {
        self.shutdown("closed");
        self.base.change_state(TransportState::Disconnected);
    }

    /// Open a native stream and return its logical id.
    pub fn open_stream(&self) -> Option<u16> {
        if self.state() != TransportState::Connected {
            return None;
        }
        let native = self.engine.lock().open_stream()?;
        let id = self.context.lock().allocate(native);
        match id {
            Some(id) => {
                log::debug!("Opened stream {}", id);
                Some(id)
            }
            None => {
                log::warn!("Logical stream ids exhausted");
                self.engine.lock().reset_stream(native, RESET_CODE_PROTOCOL);
                None
            }
        }
    }

    /// Gracefully close and unmap `stream`. Unknown ids are ignored.
    ///
    /// Messages already queued for the stream are flushed first.
    pub fn close_stream(&self, stream: u16) {
        if !self.context.lock().contains(stream) {
            return;
        }
        self.flush();
        if self.finish_stream(stream) {
            log::debug!("Closed stream {}", stream);
            self.enqueue_flush();
        }
    }

    /// Abort and unmap `stream`. Unknown ids are ignored.
    pub fn reset_stream(&self, stream: u16) {
        let removed = self.context.lock().remove(stream);
        if let Some(removed) = removed {
            self.engine
                .lock()
                .reset_stream(removed.native, RESET_CODE_PROTOCOL);
            self.forget_buffered(stream);
            log::debug!("Reset stream {}", stream);
            self.enqueue_flush();
        }
    }

    /// Configured outbound stream capacity.
    pub fn max_stream(&self) -> u64 {
        self.max_streams_out
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn clear_stats(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }

    /// Smoothed round-trip time, if a connection is established.
    pub fn rtt(&self) -> Option<Duration> {
        self.engine.lock().rtt()
    }

    /// Bytes accepted by `send` on `stream` but not yet taken by the engine.
    pub fn buffered_amount(&self, stream: u16) -> usize {
        self.buffered.lock().get(&stream).copied().unwrap_or(0)
    }

    pub fn queued_messages(&self) -> usize {
        self.send_queue.len()
    }

    /// Wait until all work scheduled so far has run.
    pub async fn join(&self) {
        self.processor.join().await;
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn schedule(&self, flight: fn(&QuicTransport) -> &SingleFlight, work: fn(&QuicTransport)) {
        if !flight(self).request() {
            return;
        }
        let weak = self.weak_self.clone();
        let queued = self.processor.enqueue(move || {
            if let Some(transport) = weak.upgrade() {
                flight(&transport).run(|| work(&transport));
            }
        });
        if !queued {
            flight(self).cancel();
        }
    }

    fn enqueue_recv(&self) {
        self.schedule(|t| &t.recv_flight, QuicTransport::do_recv);
    }

    fn enqueue_flush(&self) {
        self.schedule(|t| &t.flush_flight, QuicTransport::do_flush);
    }

    fn enqueue_timeout(&self) {
        self.schedule(|t| &t.timeout_flight, QuicTransport::do_timeout);
    }

    fn do_recv(&self) {
        let now = Instant::now();
        while let Some(datagram) = self.inbound.pop() {
            self.engine.lock().handle_datagram(now, &datagram);
        }
        self.process_engine();
    }

    fn do_flush(&self) {
        self.try_send_queue();
    }

    fn do_timeout(&self) {
        self.engine.lock().handle_timeout(Instant::now());
        self.process_engine();
    }

    /// Drain engine events, then the send queue and outbound packets.
    fn process_engine(&self) {
        self.drain_events();
        self.try_send_queue();
        self.timer_notify.notify_one();
    }

    fn start_timer(&self) {
        let weak = self.weak_self.clone();
        let notify = self.timer_notify.clone();
        let task = self.runtime.spawn(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(transport) => transport.engine.lock().poll_timeout(),
                    None => break,
                };
                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                                match weak.upgrade() {
                                    Some(transport) => transport.enqueue_timeout(),
                                    None => break,
                                }
                                // Re-arm once the timeout has been handled.
                                notify.notified().await;
                            }
                            _ = notify.notified() => {}
                        }
                    }
                    None => notify.notified().await,
                }
            }
            log::trace!("QUIC timer task exiting");
        });
        if let Some(previous) = self.timer.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_timer(&self) {
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    fn drain_events(&self) {
        loop {
            let event = self.engine.lock().poll_event();
            let Some(event) = event else {
                break;
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::NewConnection => {
                log::debug!("QUIC connection created");
            }
            EngineEvent::Connected => {
                log::info!("QUIC transport connected");
                self.base
                    .transition(TransportState::Connecting, TransportState::Connected);
            }
            EngineEvent::HandshakeFailed(reason) => {
                log::warn!("QUIC handshake failed: {}", reason);
                self.connection_lost();
                self.fail();
            }
            EngineEvent::ConnectionClosed { reason, error } => {
                if error {
                    log::warn!("QUIC connection lost: {}", reason);
                } else {
                    log::info!("QUIC connection closed: {}", reason);
                }
                self.connection_lost();
                if error {
                    self.fail();
                } else {
                    self.base.change_state(TransportState::Disconnected);
                }
            }
            EngineEvent::StreamOpened(native) => {
                let id = self.context.lock().allocate(native);
                match id {
                    Some(id) => {
                        log::debug!("Peer opened stream {}", id);
                        // First bytes of a new stream come without a readable event.
                        self.read_stream(native);
                    }
                    None => {
                        log::warn!("Logical stream ids exhausted, resetting peer stream");
                        self.engine.lock().reset_stream(native, RESET_CODE_PROTOCOL);
                    }
                }
            }
            EngineEvent::StreamReadable(native) => self.read_stream(native),
            EngineEvent::StreamStopped(native) => {
                let id = self.context.lock().logical(native);
                if let Some(id) = id {
                    log::debug!("Peer stopped stream {}", id);
                    self.remote_close(id);
                }
            }
        }
    }

    fn fail(&self) {
        if !self
            .base
            .transition(TransportState::Connecting, TransportState::Failed)
        {
            self.base
                .transition(TransportState::Connected, TransportState::Failed);
        }
    }

    /// Drop every stream and queued write after the connection went away.
    fn connection_lost(&self) {
        let ids = self.context.lock().clear();
        self.send_queue.clear();
        for id in ids {
            self.forget_buffered(id);
            self.base.recv(Message::reset(id));
        }
    }

    /// Read a mapped stream. Streams unmapped by a close are ignored.
    fn read_stream(&self, native: NativeStreamId) {
        if self.context.lock().logical(native).is_none() {
            return;
        }
        let read = self.engine.lock().read_stream(native);
        if !read.data.is_empty() {
            self.bytes_received
                .fetch_add(read.data.len(), Ordering::Relaxed);
        }

        let mut messages = Vec::new();
        let mut malformed = false;
        let id = {
            let mut context = self.context.lock();
            let Some(id) = context.logical(native) else {
                return;
            };
            let Some(stream) = context.stream_mut(id) else {
                return;
            };
            stream.reassembler.push(&read.data);
            loop {
                match stream.reassembler.next_message() {
                    Ok(Some(message)) => messages.push(message.with_stream(id)),
                    Ok(None) => break,
                    Err(err) => {
                        log::warn!("Malformed data on stream {}: {}", id, err);
                        malformed = true;
                        break;
                    }
                }
            }
            if read.end.is_some() && !stream.reassembler.is_idle() {
                log::warn!(
                    "Stream {} ended with {} bytes of incomplete frame",
                    id,
                    stream.reassembler.buffered()
                );
            }
            id
        };

        for message in messages {
            self.base.recv(message);
        }

        if malformed {
            self.reset_stream(id);
            self.base.recv(Message::reset(id));
            return;
        }
        match read.end {
            Some(StreamEnd::Finished) => {
                log::debug!("Peer finished stream {}", id);
                self.remote_close(id);
            }
            Some(StreamEnd::Reset(code)) => {
                log::debug!("Peer reset stream {} (code {})", id, code);
                self.remote_close(id);
            }
            None => {}
        }
    }

    /// The peer closed `stream`: unmap it and tell the upper layer.
    fn remote_close(&self, stream: u16) {
        if self.finish_stream(stream) {
            self.base.recv(Message::reset(stream));
        }
    }

    /// Unmap `stream` and gracefully close its native stream.
    fn finish_stream(&self, stream: u16) -> bool {
        let removed = self.context.lock().remove(stream);
        let Some(removed) = removed else {
            return false;
        };
        self.engine.lock().close_stream(removed.native);
        self.forget_buffered(stream);
        true
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    fn try_send_queue(&self) -> bool {
        let _guard = self.send_lock.lock();
        while !self.send_shutdown.load(Ordering::Acquire) {
            let Some(mut pending) = self.send_queue.pop() else {
                break;
            };
            match self.try_send_message(&mut pending) {
                WriteOutcome::Done | WriteOutcome::Dropped => {
                    if pending.finish {
                        self.finish_stream(pending.stream);
                    }
                }
                WriteOutcome::Blocked => {
                    self.send_queue.push_front(pending);
                    break;
                }
            }
        }
        self.drain_transmit();
        self.send_queue.is_empty()
    }

    fn try_send_message(&self, pending: &mut PendingWrite) -> WriteOutcome {
        let stream = pending.stream;
        let native = self.context.lock().native(stream);
        let Some(native) = native else {
            log::debug!("Dropping message for closed stream {}", stream);
            self.release_buffered(stream, pending.accounted);
            return WriteOutcome::Dropped;
        };

        let written = self.engine.lock().write_stream(native, &pending.frames);
        match written {
            Ok(0) => WriteOutcome::Blocked,
            Ok(written) => {
                self.bytes_sent.fetch_add(written, Ordering::Relaxed);
                pending.frames.advance(written);
                if pending.frames.is_empty() {
                    self.release_buffered(stream, pending.accounted);
                    WriteOutcome::Done
                } else {
                    WriteOutcome::Blocked
                }
            }
            Err(err) => {
                log::warn!("Dropping message on stream {}: {}", stream, err);
                self.release_buffered(stream, pending.accounted);
                WriteOutcome::Dropped
            }
        }
    }

    /// Hand every pending engine packet to the lower transport.
    fn drain_transmit(&self) {
        let now = Instant::now();
        loop {
            let packet = self.engine.lock().poll_transmit(now);
            let Some(packet) = packet else {
                break;
            };
            if !self.outgoing(Message::binary(packet)) {
                log::trace!("Lower transport refused QUIC packet");
            }
        }
    }

    /// Stop accepting writes and close the connection.
    fn shutdown(&self, reason: &str) {
        self.send_shutdown.store(true, Ordering::Release);
        self.send_queue.stop();
        self.send_queue.clear();
        {
            let _guard = self.send_lock.lock();
            self.engine.lock().close(Instant::now(), reason);
            self.drain_transmit();
        }
        self.stop_timer();
        let ids = self.context.lock().clear();
        for id in ids {
            self.forget_buffered(id);
        }
    }

    // ------------------------------------------------------------------
    // Buffered amount
    // ------------------------------------------------------------------

    fn update_buffered(&self, stream: u16, add: usize, sub: usize) {
        if add == 0 && sub == 0 {
            return;
        }
        let amount = {
            let mut buffered = self.buffered.lock();
            let entry = buffered.entry(stream).or_insert(0);
            *entry = (*entry + add).saturating_sub(sub);
            *entry
        };
        self.amount_callback.call((stream, amount));
    }

    fn release_buffered(&self, stream: u16, size: usize) {
        self.update_buffered(stream, 0, size);
    }

    fn forget_buffered(&self, stream: u16) {
        let previous = self.buffered.lock().remove(&stream);
        if let Some(previous) = previous {
            if previous > 0 {
                self.amount_callback.call((stream, 0));
            }
        }
    }
}

impl Transport for QuicTransport {
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn start(&self) {
        if !self
            .base
            .transition(TransportState::Disconnected, TransportState::Connecting)
        {
            return;
        }
        self.send_shutdown.store(false, Ordering::Release);
        self.send_queue.resume();
        // Events left over from a previous connection.
        let stale = std::iter::from_fn(|| self.engine.lock().poll_event()).count();
        if stale > 0 {
            log::debug!("Discarded {} events from the previous connection", stale);
        }
        let upper: Weak<dyn Transport> = self.weak_self.clone();
        self.base.register_incoming(upper);

        let connected = self.engine.lock().connect(Instant::now());
        if let Err(err) = connected {
            log::error!("QUIC connect failed: {}", err);
            self.fail();
            return;
        }
        self.start_timer();
        self.enqueue_recv();
    }

    fn stop(&self) {
        self.shutdown("stopped");
        self.base.unregister_incoming();
        self.base.change_state(TransportState::Disconnected);
    }

    /// Queue `message` for its stream. Refused unless Connected.
    ///
    /// A message without a stream id gets a stream of its own, which is
    /// finished once the message is written. Refused if no stream can be
    /// opened.
    fn send(&self, message: Message) -> bool {
        if self.state() != TransportState::Connected {
            return false;
        }
        if message.kind == MessageKind::Reset {
            return false;
        }
        let size = message.len();
        if size > self.max_message_size {
            log::warn!(
                "Message of {} bytes exceeds max message size {}",
                size,
                self.max_message_size
            );
            return false;
        }
        let (stream, finish) = match message.stream {
            Some(stream) => {
                if !self.context.lock().contains(stream) {
                    log::debug!("Send on unknown stream {}", stream);
                    return false;
                }
                (stream, false)
            }
            None => {
                let Some(stream) = self.open_stream() else {
                    log::warn!("No stream available for unbound message");
                    return false;
                };
                (stream, true)
            }
        };
        let frames = match encode_message(&message, DEFAULT_FRAGMENT_SIZE) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("Cannot frame message: {}", err);
                if finish {
                    self.finish_stream(stream);
                }
                return false;
            }
        };

        self.update_buffered(stream, size, 0);
        let pending = PendingWrite {
            stream,
            accounted: size,
            frames,
            finish,
        };
        if !self.send_queue.push(pending) {
            self.release_buffered(stream, size);
            if finish {
                self.finish_stream(stream);
            }
            return false;
        }
        self.enqueue_flush();
        true
    }

    /// Raw QUIC datagram from the lower transport.
    fn incoming(&self, message: Message) {
        if message.is_empty() {
            return;
        }
        self.inbound.push(message.data);
        self.enqueue_recv();
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("state", &self.state())
            .field("queued", &self.send_queue.len())
            .field("bytes_sent", &self.bytes_sent())
            .field("bytes_received", &self.bytes_received())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::engine::StreamRead;
    use crate::quic::frame::FrameReassembler;
    use bytes::BytesMut;
    use std::collections::VecDeque;

    /// Scriptable engine: writes become packets, reads come from `readable`.
    #[derive(Default)]
    struct FakeState {
        fail_connect: bool,
        fail_handshake: bool,
        connected: bool,
        next_stream: NativeStreamId,
        events: VecDeque<EngineEvent>,
        transmits: VecDeque<Bytes>,
        written: HashMap<NativeStreamId, BytesMut>,
        readable: HashMap<NativeStreamId, StreamRead>,
        /// Bytes the engine accepts before reporting blocked.
        capacity: Option<usize>,
        /// Streams the engine will still open; unlimited if unset.
        streams_left: Option<usize>,
        closed_streams: Vec<NativeStreamId>,
    }

    struct FakeEngine(Arc<Mutex<FakeState>>);

    impl QuicEngine for FakeEngine {
        fn connect(&mut self, _now: Instant) -> TransportResult<()> {
            let mut state = self.0.lock();
            if state.fail_connect {
                return Err(TransportError::Engine("refused".into()));
            }
            state.events.push_back(EngineEvent::NewConnection);
            if state.fail_handshake {
                state
                    .events
                    .push_back(EngineEvent::HandshakeFailed("bad certificate".into()));
            } else {
                state.connected = true;
                state.events.push_back(EngineEvent::Connected);
            }
            Ok(())
        }

        fn handle_datagram(&mut self, _now: Instant, _data: &[u8]) {}

        fn handle_timeout(&mut self, _now: Instant) {}

        fn poll_timeout(&mut self) -> Option<Instant> {
            None
        }

        fn poll_transmit(&mut self, _now: Instant) -> Option<Bytes> {
            self.0.lock().transmits.pop_front()
        }

        fn poll_event(&mut self) -> Option<EngineEvent> {
            self.0.lock().events.pop_front()
        }

        fn open_stream(&mut self) -> Option<NativeStreamId> {
            let mut state = self.0.lock();
            if !state.connected || state.streams_left == Some(0) {
                return None;
            }
            if let Some(left) = state.streams_left.as_mut() {
                *left -= 1;
            }
            let id = state.next_stream;
            state.next_stream += 4;
            Some(id)
        }

        fn write_stream(&mut self, stream: NativeStreamId, data: &[u8]) -> TransportResult<usize> {
            let mut state = self.0.lock();
            let n = match state.capacity {
                Some(capacity) => capacity.min(data.len()),
                None => data.len(),
            };
            if let Some(capacity) = state.capacity.as_mut() {
                *capacity -= n;
            }
            if n > 0 {
                state
                    .written
                    .entry(stream)
                    .or_default()
                    .extend_from_slice(&data[..n]);
                state.transmits.push_back(Bytes::copy_from_slice(&data[..n]));
            }
            Ok(n)
        }

        fn read_stream(&mut self, stream: NativeStreamId) -> StreamRead {
            self.0.lock().readable.remove(&stream).unwrap_or_default()
        }

        fn close_stream(&mut self, stream: NativeStreamId) {
            self.0.lock().closed_streams.push(stream);
        }

        fn reset_stream(&mut self, stream: NativeStreamId, _code: u64) {
            self.0.lock().closed_streams.push(stream);
        }

        fn close(&mut self, _now: Instant, _reason: &str) {
            let mut state = self.0.lock();
            if state.connected {
                state.connected = false;
                state.events.push_back(EngineEvent::ConnectionClosed {
                    reason: "closed".into(),
                    error: false,
                });
            }
        }

        fn rtt(&self) -> Option<Duration> {
            if self.0.lock().connected {
                Some(Duration::from_millis(20))
            } else {
                None
            }
        }

        fn has_connection(&self) -> bool {
            self.0.lock().connected
        }
    }

    /// Bottom of the chain; records every packet.
    struct Recorder {
        base: TransportBase,
        sent: Mutex<Vec<Message>>,
    }

    impl Transport for Recorder {
        fn base(&self) -> &TransportBase {
            &self.base
        }

        fn send(&self, message: Message) -> bool {
            self.sent.lock().push(message);
            true
        }
    }

    struct Harness {
        transport: Arc<QuicTransport>,
        engine: Arc<Mutex<FakeState>>,
        lower: Arc<Recorder>,
        received: Arc<Mutex<Vec<Message>>>,
        amounts: Arc<Mutex<Vec<(u16, usize)>>>,
        states: Arc<Mutex<Vec<TransportState>>>,
    }

    impl Harness {
        fn new(state: FakeState) -> Self {
            let engine = Arc::new(Mutex::new(state));
            let lower = Arc::new(Recorder {
                base: TransportBase::new(None, None),
                sent: Mutex::new(Vec::new()),
            });
            let received = Arc::new(Mutex::new(Vec::new()));
            let amounts = Arc::new(Mutex::new(Vec::new()));
            let states = Arc::new(Mutex::new(Vec::new()));

            let recv_sink = received.clone();
            let amount_sink = amounts.clone();
            let state_sink = states.clone();
            let transport = QuicTransport::with_engine(
                Some(lower.clone() as Arc<dyn Transport>),
                &Configuration::default(),
                &QuicSettings::client(),
                Box::new(FakeEngine(engine.clone())),
                Some(Arc::new(move |message: Message| recv_sink.lock().push(message))),
                Some(Arc::new(move |stream: u16, amount: usize| {
                    amount_sink.lock().push((stream, amount))
                })),
                Some(Arc::new(move |state: TransportState| state_sink.lock().push(state))),
            )
            .unwrap();

            Self {
                transport,
                engine,
                lower,
                received,
                amounts,
                states,
            }
        }

        async fn connected() -> Self {
            let harness = Self::new(FakeState::default());
            harness.transport.start();
            harness.settle().await;
            assert_eq!(harness.transport.state(), TransportState::Connected);
            harness
        }

        async fn settle(&self) {
            for _ in 0..3 {
                self.transport.join().await;
            }
        }

        /// Decode everything the lower transport has seen.
        fn delivered(&self) -> Vec<Message> {
            let mut reassembler = FrameReassembler::new(1 << 20);
            for packet in self.lower.sent.lock().iter() {
                reassembler.push(&packet.data);
            }
            std::iter::from_fn(|| reassembler.next_message().unwrap()).collect()
        }

        /// Pretend the peer opened `native` and wrote `frames` on it.
        fn peer_writes(&self, native: NativeStreamId, frames: &[u8], end: Option<StreamEnd>) {
            let mut state = self.engine.lock();
            state.events.push_back(EngineEvent::StreamOpened(native));
            state.events.push_back(EngineEvent::StreamReadable(native));
            state.readable.insert(
                native,
                StreamRead {
                    data: BytesMut::from(frames),
                    end,
                },
            );
        }

        /// Wake the recv path as a datagram would.
        fn poke(&self) {
            self.transport.incoming(Message::binary(vec![0u8]));
        }
    }

    #[test]
    fn test_requires_runtime() {
        let result = QuicTransport::with_engine(
            None,
            &Configuration::default(),
            &QuicSettings::client(),
            Box::new(FakeEngine(Arc::new(Mutex::new(FakeState::default())))),
            None,
            None,
            None,
        );
        assert!(matches!(result, Err(TransportError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_start_connects() {
        let harness = Harness::connected().await;
        assert_eq!(
            *harness.states.lock(),
            vec![TransportState::Connecting, TransportState::Connected]
        );
        assert!(harness.engine.lock().connected);
        assert_eq!(harness.transport.rtt(), Some(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_failed_state() {
        let harness = Harness::new(FakeState {
            fail_handshake: true,
            ..Default::default()
        });
        harness.transport.start();
        harness.settle().await;
        assert_eq!(harness.transport.state(), TransportState::Failed);
        assert!(harness.transport.rtt().is_none());
    }

    #[tokio::test]
    async fn test_connect_error_is_failed_state() {
        let harness = Harness::new(FakeState {
            fail_connect: true,
            ..Default::default()
        });
        harness.transport.start();
        assert_eq!(harness.transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_send_refused_unless_connected() {
        let harness = Harness::new(FakeState::default());
        assert!(!harness.transport.send(Message::binary(vec![1u8; 10])));
        assert_eq!(harness.transport.queued_messages(), 0);

        harness.transport.start();
        // Connecting until the engine reports the handshake.
        assert_eq!(harness.transport.state(), TransportState::Connecting);
        assert!(!harness.transport.send(Message::binary(vec![1u8; 10])));
        assert_eq!(harness.transport.queued_messages(), 0);
        assert!(harness.amounts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_per_stream_order_preserved() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        for i in 0..50u32 {
            assert!(harness
                .transport
                .send(Message::binary(i.to_be_bytes().to_vec()).with_stream(stream)));
        }
        harness.settle().await;

        let delivered: Vec<u32> = harness
            .delivered()
            .iter()
            .map(|message| u32::from_be_bytes(message.data[..].try_into().unwrap()))
            .collect();
        assert_eq!(delivered, (0..50).collect::<Vec<_>>());
        assert!(harness.transport.bytes_sent() > 0);
    }

    #[tokio::test]
    async fn test_unbound_message_opens_stream() {
        let harness = Harness::connected().await;
        assert!(harness.transport.send(Message::string("hello")));
        harness.settle().await;
        assert_eq!(harness.delivered(), vec![Message::string("hello")]);
        // Finished and unmapped once written.
        assert!(!harness.transport.context.lock().contains(0));
        assert_eq!(harness.engine.lock().closed_streams, vec![0]);
        assert_eq!(harness.transport.buffered_amount(0), 0);
    }

    #[tokio::test]
    async fn test_unbound_streams_do_not_accumulate() {
        let harness = Harness::connected().await;
        let bound = harness.transport.open_stream().unwrap();
        for i in 0..5 {
            assert!(harness.transport.send(Message::string(format!("m{}", i))));
        }
        harness.settle().await;

        assert_eq!(harness.delivered().len(), 5);
        let context = harness.transport.context.lock();
        assert_eq!(context.map_sizes(), (1, 1));
        assert!(context.contains(bound));
        drop(context);
        assert_eq!(harness.engine.lock().closed_streams.len(), 5);
    }

    #[tokio::test]
    async fn test_unbound_stream_kept_until_fully_written() {
        let harness = Harness::connected().await;
        harness.engine.lock().capacity = Some(4);
        assert!(harness.transport.send(Message::binary(vec![7u8; 32])));
        harness.settle().await;
        assert!(harness.transport.context.lock().contains(0));
        assert!(harness.engine.lock().closed_streams.is_empty());

        harness.engine.lock().capacity = None;
        assert!(harness.transport.flush());
        assert!(!harness.transport.context.lock().contains(0));
        assert_eq!(harness.delivered(), vec![Message::binary(vec![7u8; 32])]);
    }

    #[tokio::test]
    async fn test_unbound_send_refused_without_stream_credit() {
        let harness = Harness::connected().await;
        harness.engine.lock().streams_left = Some(0);
        assert!(!harness.transport.send(Message::string("nowhere")));
        assert_eq!(harness.transport.queued_messages(), 0);
        assert!(harness.transport.context.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let harness = Harness::connected().await;
        harness.transport.stop();
        harness.settle().await;
        assert_eq!(harness.transport.state(), TransportState::Disconnected);

        harness.transport.start();
        harness.settle().await;
        assert_eq!(harness.transport.state(), TransportState::Connected);
        assert_eq!(
            *harness.states.lock(),
            vec![
                TransportState::Connecting,
                TransportState::Connected,
                TransportState::Disconnected,
                TransportState::Connecting,
                TransportState::Connected,
            ]
        );
        let stream = harness.transport.open_stream().unwrap();
        assert!(harness
            .transport
            .send(Message::string("again").with_stream(stream)));
    }

    #[tokio::test]
    async fn test_send_on_unknown_stream_refused() {
        let harness = Harness::connected().await;
        assert!(!harness.transport.send(Message::binary(vec![1u8]).with_stream(9)));
        assert_eq!(harness.transport.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_oversize_message_refused() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        let size = harness.transport.max_message_size() + 1;
        assert!(!harness
            .transport
            .send(Message::binary(vec![0u8; size]).with_stream(stream)));
        assert_eq!(harness.transport.buffered_amount(stream), 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_idempotent() {
        let harness = Harness::connected().await;
        let packets = harness.lower.sent.lock().len();
        assert!(harness.transport.flush());
        assert!(harness.transport.flush());
        assert_eq!(harness.lower.sent.lock().len(), packets);
        assert!(harness.amounts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_amount_returns_to_zero() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        assert!(harness
            .transport
            .send(Message::binary(vec![7u8; 300]).with_stream(stream)));
        harness.settle().await;

        assert_eq!(harness.transport.buffered_amount(stream), 0);
        assert_eq!(*harness.amounts.lock(), vec![(stream, 300), (stream, 0)]);
    }

    #[tokio::test]
    async fn test_partial_write_keeps_remainder_at_head() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        harness.engine.lock().capacity = Some(10);

        assert!(harness
            .transport
            .send(Message::binary(vec![1u8; 100]).with_stream(stream)));
        assert!(harness
            .transport
            .send(Message::binary(vec![2u8; 20]).with_stream(stream)));
        harness.settle().await;

        assert_eq!(harness.transport.queued_messages(), 2);
        assert_eq!(harness.transport.buffered_amount(stream), 120);
        assert!(!harness.transport.flush());

        harness.engine.lock().capacity = None;
        assert!(harness.transport.flush());
        assert_eq!(harness.transport.buffered_amount(stream), 0);

        let delivered = harness.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].data, Bytes::from(vec![1u8; 100]));
        assert_eq!(delivered[1].data, Bytes::from(vec![2u8; 20]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_sends_all_delivered() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();

        let threads: Vec<_> = (0..8u8)
            .map(|i| {
                let transport = harness.transport.clone();
                std::thread::spawn(move || {
                    (0..25u8)
                        .map(|j| transport.send(Message::binary(vec![i, j]).with_stream(stream)))
                        .all(|sent| sent)
                })
            })
            .collect();
        for thread in threads {
            assert!(thread.join().unwrap());
        }
        harness.settle().await;
        assert!(harness.transport.flush());

        let mut delivered: Vec<Vec<u8>> = harness
            .delivered()
            .into_iter()
            .map(|message| message.data.to_vec())
            .collect();
        assert_eq!(delivered.len(), 200);
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 200);
        assert_eq!(harness.transport.buffered_amount(stream), 0);
    }

    #[tokio::test]
    async fn test_incoming_stream_tagged_with_logical_id() {
        let harness = Harness::connected().await;
        let mut frames = BytesMut::new();
        frames.extend_from_slice(&encode_message(&Message::string("first"), 1024).unwrap());
        let empty = Message::binary(Vec::<u8>::new());
        frames.extend_from_slice(&encode_message(&empty, 1024).unwrap());
        harness.peer_writes(101, &frames, None);
        harness.poke();
        harness.settle().await;

        let received = harness.received.lock().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], Message::string("first").with_stream(0));
        assert_eq!(received[1].kind, MessageKind::Binary);
        assert!(received[1].is_empty());
        assert_eq!(harness.transport.bytes_received(), frames.len());

        harness.transport.clear_stats();
        assert_eq!(harness.transport.bytes_received(), 0);
    }

    #[tokio::test]
    async fn test_remote_finish_surfaces_reset() {
        let harness = Harness::connected().await;
        harness.peer_writes(
            101,
            &encode_message(&Message::string("bye"), 1024).unwrap(),
            Some(StreamEnd::Finished),
        );
        harness.poke();
        harness.settle().await;

        let received = harness.received.lock().clone();
        assert_eq!(received.last(), Some(&Message::reset(0)));
        assert!(!harness.transport.context.lock().contains(0));
        assert_eq!(harness.engine.lock().closed_streams, vec![101]);
    }

    #[tokio::test]
    async fn test_malformed_frame_resets_stream() {
        let harness = Harness::connected().await;
        harness.peer_writes(101, &[0xff, 0, 0, 0, 1, 0], None);
        harness.poke();
        harness.settle().await;

        assert_eq!(harness.received.lock().clone(), vec![Message::reset(0)]);
        assert!(harness.transport.context.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stream_map_bijection_after_closes() {
        let harness = Harness::connected().await;
        let ids: Vec<u16> = (0..10)
            .map(|_| harness.transport.open_stream().unwrap())
            .collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());

        for id in [2u16, 3, 5, 9] {
            harness.transport.close_stream(id);
        }
        // Unknown and repeated ids are ignored.
        harness.transport.close_stream(3);
        harness.transport.close_stream(42);

        let context = harness.transport.context.lock();
        assert_eq!(context.map_sizes(), (6, 6));
        for id in context.ids() {
            let native = context.native(id).unwrap();
            assert_eq!(context.logical(native), Some(id));
        }
        assert_eq!(harness.engine.lock().closed_streams.len(), 4);
    }

    #[tokio::test]
    async fn test_close_stream_flushes_queued_data_first() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        assert!(harness
            .transport
            .send(Message::string("last words").with_stream(stream)));
        harness.transport.close_stream(stream);
        harness.settle().await;
        assert_eq!(harness.delivered(), vec![Message::string("last words")]);
    }

    #[tokio::test]
    async fn test_stop_disconnects_and_refuses_sends() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        harness.transport.stop();
        harness.settle().await;

        assert_eq!(harness.transport.state(), TransportState::Disconnected);
        assert!(!harness.transport.send(Message::binary(vec![1u8]).with_stream(stream)));
        assert!(harness.transport.context.lock().is_empty());
        assert!(harness.transport.rtt().is_none());
    }

    #[tokio::test]
    async fn test_remote_close_moves_to_disconnected() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        harness
            .engine
            .lock()
            .events
            .push_back(EngineEvent::ConnectionClosed {
                reason: "peer closed".into(),
                error: false,
            });
        harness.poke();
        harness.settle().await;

        assert_eq!(harness.transport.state(), TransportState::Disconnected);
        assert!(harness.received.lock().contains(&Message::reset(stream)));
    }

    #[tokio::test]
    async fn test_engine_error_moves_to_failed() {
        let harness = Harness::connected().await;
        harness
            .engine
            .lock()
            .events
            .push_back(EngineEvent::ConnectionClosed {
                reason: "idle timeout".into(),
                error: true,
            });
        harness.poke();
        harness.settle().await;
        assert_eq!(harness.transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_completed_is_never_automatic() {
        let harness = Harness::connected().await;
        let stream = harness.transport.open_stream().unwrap();
        harness
            .transport
            .send(Message::binary(vec![1u8]).with_stream(stream));
        harness.settle().await;
        assert!(harness.transport.flush());
        assert_eq!(harness.transport.state(), TransportState::Connected);
        assert!(harness.transport.base().complete());
        assert_eq!(harness.transport.state(), TransportState::Completed);
    }
}
