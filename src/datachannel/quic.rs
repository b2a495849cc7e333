//! Data channels carried on QUIC streams.
//!
//! QUIC streams have no notion of a channel label, so the side that opens a
//! channel writes an open message as the first frame on the stream:
//!
//! ```text
//! QUIC_DATA_CHANNEL_OPEN:<label>:<protocol>
//! ```
//!
//! It travels as a `Control` frame, which is what distinguishes it from
//! application data. The label ends at the first `:`; there is no escaping.

use super::channel::{DataChannel, Reliability};
use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::message::{Message, MessageKind, MessageVariant};
use crate::quic::QuicTransport;
use crate::queue::Queue;
use crate::transport::{Callback, SynchronizedCallback, Transport};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub const OPEN_MESSAGE_PREFIX: &str = "QUIC_DATA_CHANNEL_OPEN:";

/// Which side created the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Created locally; sends the open message.
    Outgoing,
    /// Created for a stream the peer opened; parses the open message.
    Incoming,
}

/// Build the open message for `label` and `protocol`.
pub fn open_message(label: &str, protocol: &str) -> Message {
    Message::control(format!("{}{}:{}", OPEN_MESSAGE_PREFIX, label, protocol).into_bytes())
}

/// Split an open message payload into `(label, protocol)`.
fn parse_open_message(data: &[u8]) -> Option<(String, String)> {
    let rest = data.strip_prefix(OPEN_MESSAGE_PREFIX.as_bytes())?;
    let text = std::str::from_utf8(rest).ok()?;
    let (label, protocol) = text.split_once(':').unwrap_or((text, ""));
    Some((label.to_string(), protocol.to_string()))
}

struct ChannelState {
    stream: Option<u16>,
    label: String,
    protocol: String,
    reliability: Reliability,
    transport: Weak<QuicTransport>,
}

/// One data channel bound to one QUIC stream.
pub struct QuicDataChannel {
    kind: ChannelKind,
    state: RwLock<ChannelState>,
    open: AtomicBool,
    closed: AtomicBool,
    recv_queue: Queue<Message>,

    buffered_amount: AtomicUsize,
    buffered_amount_low_threshold: AtomicUsize,

    open_callback: SynchronizedCallback<()>,
    closed_callback: SynchronizedCallback<()>,
    available_callback: SynchronizedCallback<usize>,
    buffered_amount_low_callback: SynchronizedCallback<()>,
    /// Owner bookkeeping, called with the stream id once the channel closes.
    release_hook: SynchronizedCallback<u16>,
}

impl QuicDataChannel {
    fn new(kind: ChannelKind, state: ChannelState) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: RwLock::new(state),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_queue: Queue::new(),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low_threshold: AtomicUsize::new(0),
            open_callback: SynchronizedCallback::default(),
            closed_callback: SynchronizedCallback::default(),
            available_callback: SynchronizedCallback::default(),
            buffered_amount_low_callback: SynchronizedCallback::default(),
            release_hook: SynchronizedCallback::default(),
        })
    }

    /// A locally requested channel. Bind it with
    /// [`assign_stream`](Self::assign_stream) before opening.
    pub fn new_outgoing(
        label: impl Into<String>,
        protocol: impl Into<String>,
        reliability: Reliability,
    ) -> Arc<Self> {
        Self::new(
            ChannelKind::Outgoing,
            ChannelState {
                stream: None,
                label: label.into(),
                protocol: protocol.into(),
                reliability,
                transport: Weak::new(),
            },
        )
    }

    /// An anonymous channel for a stream the peer opened.
    pub fn new_incoming(transport: Weak<QuicTransport>, stream: u16) -> Arc<Self> {
        Self::new(
            ChannelKind::Incoming,
            ChannelState {
                stream: Some(stream),
                label: String::new(),
                protocol: String::new(),
                reliability: Reliability::default(),
                transport,
            },
        )
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Bind to `stream`. Refused once the channel is open or closed.
    pub fn assign_stream(&self, stream: u16) -> bool {
        let mut state = self.state.write();
        if self.is_open() || self.is_closed() {
            return false;
        }
        state.stream = Some(stream);
        true
    }

    /// Open the channel on `transport`.
    ///
    /// An outgoing channel writes its open message before anything else can
    /// be sent. Returns false if the channel is unbound, closed, or the
    /// transport refused the open message.
    pub fn open(&self, transport: &Arc<QuicTransport>) -> bool {
        self.open_on(Arc::downgrade(transport))
    }

    fn open_on(&self, transport: Weak<QuicTransport>) -> bool {
        {
            let mut state = self.state.write();
            if self.is_closed() {
                return false;
            }
            if self.is_open() {
                return true;
            }
            let Some(stream) = state.stream else {
                log::warn!("Data channel '{}' has no stream", state.label);
                return false;
            };
            if !state.reliability.is_reliable() {
                log::warn!(
                    "Data channel '{}' requested partial reliability; QUIC streams are always reliable",
                    state.label
                );
            }
            state.transport = transport;

            if self.kind == ChannelKind::Outgoing {
                let Some(transport) = state.transport.upgrade() else {
                    return false;
                };
                let message = open_message(&state.label, &state.protocol).with_stream(stream);
                if !transport.send(message) {
                    log::warn!("Transport refused open message for '{}'", state.label);
                    return false;
                }
            }
            self.open.store(true, Ordering::Release);
            log::debug!(
                "Data channel '{}' ({}) open on stream {}",
                state.label,
                state.protocol,
                stream
            );
        }
        self.open_callback.call(());
        true
    }

    /// True if `message` is a channel open message.
    pub fn is_open_message(message: &Message) -> bool {
        message.kind == MessageKind::Control
            && !message.is_empty()
            && message.data.starts_with(OPEN_MESSAGE_PREFIX.as_bytes())
    }

    /// Take label and protocol from the peer's open message and open.
    ///
    /// Returns false, leaving the channel untouched, if the message is not
    /// an open message or this is not an unopened incoming channel.
    pub fn process_open_message(&self, message: &Message) -> bool {
        if self.kind != ChannelKind::Incoming || self.is_open() || self.is_closed() {
            return false;
        }
        if !Self::is_open_message(message) {
            return false;
        }
        let Some((label, protocol)) = parse_open_message(&message.data) else {
            log::debug!("Open message is not valid UTF-8");
            return false;
        };
        log::debug!("Peer opened data channel '{}' ({})", label, protocol);
        let transport = {
            let mut state = self.state.write();
            state.label = label;
            state.protocol = protocol;
            state.transport.clone()
        };
        self.open_on(transport)
    }

    /// The open message this channel sends.
    pub fn open_message(&self) -> Message {
        let state = self.state.read();
        open_message(&state.label, &state.protocol)
    }

    /// Write `message` on the channel's stream.
    pub fn outgoing(&self, message: Message) -> bool {
        let (stream, transport) = {
            let state = self.state.read();
            if !self.is_open() || self.is_closed() {
                return false;
            }
            (state.stream, state.transport.upgrade())
        };
        match (stream, transport) {
            (Some(stream), Some(transport)) => transport.send(message.with_stream(stream)),
            _ => false,
        }
    }

    /// Message read from the channel's stream.
    pub fn incoming(&self, message: Message) {
        if message.kind == MessageKind::Reset {
            self.remote_close();
            return;
        }
        let available = {
            let _state = self.state.write();
            if self.is_closed() {
                return;
            }
            self.recv_queue.push(message);
            self.recv_queue.len()
        };
        self.available_callback.call(available);
    }

    /// The peer closed the stream.
    pub fn remote_close(&self) {
        if !self.mark_closed() {
            return;
        }
        log::debug!("Data channel '{}' closed by peer", self.label_string());
        self.release();
        self.closed_callback.call(());
    }

    fn mark_closed(&self) -> bool {
        let _state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.open.store(false, Ordering::Release);
        true
    }

    fn release(&self) {
        if let Some(stream) = self.state.read().stream {
            self.release_hook.call(stream);
        }
    }

    /// Called once with the stream id when the channel closes either way.
    pub(crate) fn on_release(&self, hook: Option<Callback<u16>>) {
        self.release_hook.set(hook);
    }

    fn label_string(&self) -> String {
        self.state.read().label.clone()
    }

    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::Acquire)
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered_amount_low_threshold
            .store(threshold, Ordering::Release);
    }

    /// Record the transport's buffered amount for this channel's stream.
    pub fn update_buffered_amount(&self, amount: usize) {
        let previous = self.buffered_amount.swap(amount, Ordering::AcqRel);
        let threshold = self.buffered_amount_low_threshold.load(Ordering::Acquire);
        if previous > threshold && amount <= threshold {
            self.buffered_amount_low_callback.call(());
        }
    }

    pub fn on_open(&self, callback: Option<Callback<()>>) {
        self.open_callback.set(callback);
    }

    pub fn on_closed(&self, callback: Option<Callback<()>>) {
        self.closed_callback.set(callback);
    }

    /// Called with the queue depth after each received message.
    pub fn on_available(&self, callback: Option<Callback<usize>>) {
        self.available_callback.set(callback);
    }

    pub fn on_buffered_amount_low(&self, callback: Option<Callback<()>>) {
        self.buffered_amount_low_callback.set(callback);
    }
}

impl DataChannel for QuicDataChannel {
    fn stream(&self) -> Option<u16> {
        self.state.read().stream
    }

    fn label(&self) -> String {
        self.state.read().label.clone()
    }

    fn protocol(&self) -> String {
        self.state.read().protocol.clone()
    }

    fn reliability(&self) -> Reliability {
        self.state.read().reliability
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn max_message_size(&self) -> usize {
        self.state
            .read()
            .transport
            .upgrade()
            .map(|transport| transport.max_message_size())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    fn send(&self, message: MessageVariant) -> bool {
        self.outgoing(Message::from(message))
    }

    fn receive(&self) -> Option<MessageVariant> {
        self.recv_queue.pop().map(|message| message.to_variant())
    }

    fn peek(&self) -> Option<MessageVariant> {
        self.recv_queue.peek_with(|message| message.to_variant())
    }

    fn available_amount(&self) -> usize {
        self.recv_queue.len()
    }

    /// Close locally and close the stream on the transport.
    fn close(&self) {
        let (stream, transport) = {
            let state = self.state.read();
            (state.stream, state.transport.upgrade())
        };
        if !self.mark_closed() {
            return;
        }
        if let (Some(stream), Some(transport)) = (stream, transport) {
            transport.close_stream(stream);
        }
        log::debug!("Data channel '{}' closed", self.label_string());
        self.release();
        self.closed_callback.call(());
    }
}

impl std::fmt::Debug for QuicDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("QuicDataChannel")
            .field("kind", &self.kind)
            .field("stream", &state.stream)
            .field("label", &state.label)
            .field("protocol", &state.protocol)
            .field("open", &self.is_open())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
