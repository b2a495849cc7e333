//! Routes transport traffic to data channels.
//!
//! The manager installs itself as the [`QuicTransport`]'s receive and
//! buffered-amount consumer. Messages go to the channel that owns their
//! stream; the first message on a stream the peer opened creates an incoming
//! channel. That channel is announced once the peer's open message arrives.
//! Data that precedes the open message waits in the unopened channel's
//! receive queue. Closed channels leave the map.

use super::channel::{DataChannel, Reliability};
use super::quic::{ChannelKind, QuicDataChannel};
use crate::message::{Message, MessageKind};
use crate::quic::QuicTransport;
use crate::transport::{Callback, SynchronizedCallback};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type DataChannelCallback = Callback<Arc<QuicDataChannel>>;

pub struct DataChannelManager {
    weak_self: Weak<Self>,
    transport: Arc<QuicTransport>,
    channels: RwLock<HashMap<u16, Arc<QuicDataChannel>>>,
    data_channel_callback: SynchronizedCallback<Arc<QuicDataChannel>>,
}

impl DataChannelManager {
    /// Take over `transport`'s receive and buffered-amount callbacks.
    pub fn attach(transport: Arc<QuicTransport>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            transport: transport.clone(),
            channels: RwLock::new(HashMap::new()),
            data_channel_callback: SynchronizedCallback::default(),
        });

        let weak = Arc::downgrade(&manager);
        transport.on_recv(Some(Arc::new(move |message: Message| {
            if let Some(manager) = weak.upgrade() {
                manager.dispatch(message);
            }
        })));
        let weak: Weak<Self> = Arc::downgrade(&manager);
        transport.on_buffered_amount(Some(Arc::new(move |stream: u16, amount: usize| {
            if let Some(manager) = weak.upgrade() {
                if let Some(channel) = manager.channel(stream) {
                    channel.update_buffered_amount(amount);
                }
            }
        })));
        manager
    }

    pub fn transport(&self) -> &Arc<QuicTransport> {
        &self.transport
    }

    /// Called for every channel the peer opens.
    pub fn on_data_channel(&self, callback: Option<DataChannelCallback>) {
        self.data_channel_callback.set(callback);
    }

    /// Open a stream, bind a new outgoing channel to it and send the open
    /// message.
    pub fn create_data_channel(
        &self,
        label: &str,
        protocol: &str,
        reliability: Reliability,
    ) -> Option<Arc<QuicDataChannel>> {
        let stream = self.transport.open_stream()?;
        let channel = QuicDataChannel::new_outgoing(label, protocol, reliability);
        channel.assign_stream(stream);
        self.track(&channel, stream);

        if !channel.open(&self.transport) {
            self.channels.write().remove(&stream);
            self.transport.close_stream(stream);
            return None;
        }
        Some(channel)
    }

    pub fn channel(&self, stream: u16) -> Option<Arc<QuicDataChannel>> {
        self.channels.read().get(&stream).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Close every channel.
    pub fn close_all(&self) {
        let channels: Vec<_> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }

    fn dispatch(&self, message: Message) {
        let Some(stream) = message.stream else {
            log::debug!("Dropping message without stream");
            return;
        };

        let channel = match self.channel(stream) {
            Some(channel) => channel,
            None if message.kind == MessageKind::Reset => return,
            None => {
                let channel =
                    QuicDataChannel::new_incoming(Arc::downgrade(&self.transport), stream);
                self.track(&channel, stream);
                channel
            }
        };

        if channel.kind() == ChannelKind::Incoming
            && !channel.is_open()
            && channel.process_open_message(&message)
        {
            self.announce(channel);
            return;
        }
        if channel.kind() == ChannelKind::Incoming
            && !channel.is_open()
            && message.kind != MessageKind::Reset
        {
            log::debug!("Stream {} carried data before an open message", stream);
        }
        // A reset closes the channel, which drops it from the map.
        channel.incoming(message);
        if channel.is_closed() {
            self.channels.write().remove(&stream);
        }
    }

    /// Insert `channel` and drop it from the map once it closes.
    fn track(&self, channel: &Arc<QuicDataChannel>, stream: u16) {
        let weak = self.weak_self.clone();
        channel.on_release(Some(Arc::new(move |stream: u16| {
            if let Some(manager) = weak.upgrade() {
                manager.channels.write().remove(&stream);
            }
        })));
        self.channels.write().insert(stream, channel.clone());
    }

    fn announce(&self, channel: Arc<QuicDataChannel>) {
        if !self.data_channel_callback.call(channel.clone()) {
            log::debug!("No data channel handler for '{}'", channel.label());
        }
    }
}

impl Drop for DataChannelManager {
    fn drop(&mut self) {
        self.transport.on_recv(None);
        self.transport.on_buffered_amount(None);
    }
}

impl std::fmt::Debug for DataChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelManager")
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}
