//! QUIC transport: engine binding, stream framing and multiplexing.

pub mod context;
pub mod engine;
pub mod frame;
pub mod tls;
pub mod transport;

pub use engine::{EngineEvent, NativeStreamId, QuicEngine, QuinnEngine};
pub use tls::{normalize_fingerprint, Identity};
pub use transport::{AmountCallback, QuicTransport};
