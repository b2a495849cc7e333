//! Data channels over the QUIC transport.

pub mod channel;
pub mod manager;
pub mod quic;

pub use channel::{DataChannel, Reliability};
pub use manager::{DataChannelCallback, DataChannelManager};
pub use quic::{open_message, ChannelKind, QuicDataChannel, OPEN_MESSAGE_PREFIX};
