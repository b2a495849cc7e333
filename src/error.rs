//! Error types for the QUIC data-channel transport.

use thiserror::Error;

/// Transport-level errors.
///
/// Only construction and configuration paths return these. Runtime failures
/// of an established transport are folded into [`TransportState`] changes and
/// boolean/optional returns instead.
///
/// [`TransportState`]: crate::transport::TransportState
#[derive(Debug, Error)]
pub enum TransportError {
    /// QUIC engine could not be created or refused to connect.
    #[error("QUIC engine error: {0}")]
    Engine(String),

    /// Certificate, key or rustls configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No tokio runtime available to host the transport's task queue.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A stream carried bytes that do not form valid frames.
    #[error("Frame error: {0}")]
    Frame(String),
}

impl TransportError {
    /// Returns true if this error prevents a transport from being created.
    ///
    /// Fatal errors come from engine creation, TLS setup, configuration and
    /// runtime lookup. Frame errors only affect a single stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Engine(_)
                | TransportError::Tls(_)
                | TransportError::Config(_)
                | TransportError::Runtime(_)
        )
    }
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        TransportError::Tls(err.to_string())
    }
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::Engine("boom".into()).is_fatal());
        assert!(TransportError::Tls("bad cert".into()).is_fatal());
        assert!(TransportError::Runtime("no runtime".into()).is_fatal());
        assert!(!TransportError::Frame("bad tag".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = TransportError::Config("max_streams_out must be > 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_streams_out must be > 0"
        );
    }
}
