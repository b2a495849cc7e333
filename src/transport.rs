//! Layered transport abstraction.
//!
//! Every transport in the stack (socket, ICE, DTLS, QUIC) implements
//! [`Transport`] and embeds a [`TransportBase`]. A transport owns a strong
//! reference to the transport below it; the upward receive hook it installs
//! on that lower transport is weak, so dropping the upper layer never leaks
//! through the chain.

use crate::message::Message;
use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Connection lifecycle shared by all transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Completed = 3,
    Failed = 4,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Completed,
            4 => TransportState::Failed,
            _ => TransportState::Disconnected,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Completed => "completed",
            TransportState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;
pub type StateCallback = Callback<TransportState>;
pub type MessageCallback = Callback<Message>;

/// A replaceable callback slot.
///
/// The slot lock is released before the callback runs, so a callback may
/// replace or clear its own slot.
pub struct SynchronizedCallback<T> {
    slot: RwLock<Option<Callback<T>>>,
}

impl<T> SynchronizedCallback<T> {
    pub fn new(callback: Option<Callback<T>>) -> Self {
        Self {
            slot: RwLock::new(callback),
        }
    }

    pub fn set(&self, callback: Option<Callback<T>>) {
        *self.slot.write() = callback;
    }

    /// Invoke the callback. Returns false if none is set.
    pub fn call(&self, arg: T) -> bool {
        let callback = self.slot.read().clone();
        match callback {
            Some(callback) => {
                callback(arg);
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }
}

impl<T> Default for SynchronizedCallback<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> fmt::Debug for SynchronizedCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedCallback")
            .field("set", &self.is_set())
            .finish()
    }
}

/// State shared by every transport implementation.
pub struct TransportBase {
    lower: Option<Arc<dyn Transport>>,
    state: AtomicU8,
    /// Serializes transitions; reentrant so a state callback may itself
    /// trigger a transition on the same thread.
    transition: ReentrantMutex<()>,
    state_callback: SynchronizedCallback<TransportState>,
    recv_callback: SynchronizedCallback<Message>,
}

impl TransportBase {
    pub fn new(lower: Option<Arc<dyn Transport>>, state_callback: Option<StateCallback>) -> Self {
        Self {
            lower,
            state: AtomicU8::new(TransportState::Disconnected as u8),
            transition: ReentrantMutex::new(()),
            state_callback: SynchronizedCallback::new(state_callback),
            recv_callback: SynchronizedCallback::default(),
        }
    }

    pub fn lower(&self) -> Option<&Arc<dyn Transport>> {
        self.lower.as_ref()
    }

    /// Lock-free state read.
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn on_recv(&self, callback: Option<MessageCallback>) {
        self.recv_callback.set(callback);
    }

    pub fn on_state_change(&self, callback: Option<StateCallback>) {
        self.state_callback.set(callback);
    }

    /// Move to `state`. The callback fires only if the state actually changed.
    pub fn change_state(&self, state: TransportState) -> bool {
        let _guard = self.transition.lock();
        let previous = TransportState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous == state {
            return false;
        }
        log::debug!("Transport state {} -> {}", previous, state);
        self.state_callback.call(state);
        true
    }

    /// Move to `to` only if the current state is `from`.
    pub fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let _guard = self.transition.lock();
        if self.state() != from {
            return false;
        }
        self.change_state(to)
    }

    /// Application signal that all data has been flushed.
    ///
    /// Only a Connected transport can complete.
    pub fn complete(&self) -> bool {
        self.transition(TransportState::Connected, TransportState::Completed)
    }

    /// Hand a message to the upper layer. Returns false if nobody listens.
    pub fn recv(&self, message: Message) -> bool {
        self.recv_callback.call(message)
    }

    /// Install `upper`'s `incoming` as the lower transport's receive hook.
    pub fn register_incoming(&self, upper: Weak<dyn Transport>) {
        if let Some(lower) = &self.lower {
            lower.base().on_recv(Some(Arc::new(move |message: Message| {
                if let Some(upper) = upper.upgrade() {
                    upper.incoming(message);
                }
            })));
        }
    }

    pub fn unregister_incoming(&self) {
        if let Some(lower) = &self.lower {
            lower.base().on_recv(None);
        }
    }
}

impl fmt::Debug for TransportBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBase")
            .field("state", &self.state())
            .field("has_lower", &self.lower.is_some())
            .finish()
    }
}

/// A layer in the transport chain.
///
/// The provided methods implement a pass-through layer; concrete transports
/// override the hooks they need.
pub trait Transport: Send + Sync + 'static {
    fn base(&self) -> &TransportBase;

    fn start(&self) {
        self.base()
            .transition(TransportState::Disconnected, TransportState::Connecting);
    }

    fn stop(&self) {
        self.base().unregister_incoming();
        self.base().change_state(TransportState::Disconnected);
    }

    /// Send downwards. Refused unless Connected.
    fn send(&self, message: Message) -> bool {
        if self.state() != TransportState::Connected {
            return false;
        }
        self.outgoing(message)
    }

    /// Data arriving from the lower transport.
    fn incoming(&self, message: Message) {
        self.base().recv(message);
    }

    /// Data leaving towards the lower transport.
    fn outgoing(&self, message: Message) -> bool {
        match self.base().lower() {
            Some(lower) => lower.send(message),
            None => false,
        }
    }

    fn state(&self) -> TransportState {
        self.base().state()
    }
}
