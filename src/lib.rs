//! quic-datachannel library
//!
//! QUIC transport layer for a peer-to-peer transport stack: a layered
//! transport state machine, a sans-IO QUIC engine binding that multiplexes
//! data channels on QUIC streams, and the data-channel open handshake.

pub mod config;
pub mod datachannel;
pub mod error;
pub mod global;
pub mod message;
pub mod processor;
pub mod queue;
pub mod quic;
pub mod transport;

pub use config::{load_config, Configuration, QuicSettings, Role};
pub use datachannel::{DataChannel, DataChannelManager, QuicDataChannel, Reliability};
pub use error::{TransportError, TransportResult};
pub use message::{Message, MessageKind, MessageVariant};
pub use quic::{Identity, QuicTransport};
pub use transport::{Transport, TransportBase, TransportState};
