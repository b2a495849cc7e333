//! Data-channel contract shared by every channel transport.

use crate::message::MessageVariant;
use std::time::Duration;

/// Delivery guarantees requested for a channel.
///
/// Carried for compatibility with SCTP-style channels. QUIC streams are
/// always ordered and reliable, so QUIC channels only record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reliability {
    pub unordered: bool,
    /// Give up after this many retransmissions.
    pub max_retransmits: Option<u32>,
    /// Give up after this long.
    pub max_packet_life_time: Option<Duration>,
}

impl Reliability {
    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn unordered() -> Self {
        Self {
            unordered: true,
            ..Self::default()
        }
    }

    /// True if ordered delivery with unlimited retransmission is requested.
    pub fn is_reliable(&self) -> bool {
        !self.unordered && self.max_retransmits.is_none() && self.max_packet_life_time.is_none()
    }
}

/// A bidirectional message channel.
///
/// Operations report failure through their return values; state reads are
/// valid in every state, including after close.
pub trait DataChannel: Send + Sync {
    /// Logical stream the channel is bound to.
    fn stream(&self) -> Option<u16>;
    fn label(&self) -> String;
    fn protocol(&self) -> String;
    fn reliability(&self) -> Reliability;

    fn is_open(&self) -> bool;
    fn is_closed(&self) -> bool;

    fn max_message_size(&self) -> usize;

    /// Queue a message. Returns false if the channel is not open or the
    /// transport refused it.
    fn send(&self, message: MessageVariant) -> bool;

    /// Pop the next received message.
    fn receive(&self) -> Option<MessageVariant>;

    /// Inspect the next received message without removing it.
    fn peek(&self) -> Option<MessageVariant>;

    /// Number of received messages waiting.
    fn available_amount(&self) -> usize;

    fn close(&self);
}
