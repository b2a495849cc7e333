//! Messages flowing through the transport stack.

use bytes::Bytes;

/// Kind of payload carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Opaque bytes.
    Binary,
    /// UTF-8 text.
    String,
    /// Data-channel control payload (the open handshake).
    Control,
    /// The stream was closed by the remote side. Carries no payload.
    Reset,
}

/// A single message.
///
/// Messages are moved, never shared: once pushed into a queue or handed to a
/// transport the sender no longer holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Bytes,
    /// Logical stream the message belongs to, if any.
    pub stream: Option<u16>,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
            stream: None,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, data)
    }

    pub fn string(text: impl Into<String>) -> Self {
        Self::new(MessageKind::String, Bytes::from(text.into()))
    }

    pub fn control(data: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Control, data)
    }

    /// Remote-close notification for `stream`.
    pub fn reset(stream: u16) -> Self {
        Self::new(MessageKind::Reset, Bytes::new()).with_stream(stream)
    }

    /// Tag the message with a logical stream id.
    pub fn with_stream(mut self, stream: u16) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Materialize into the application-facing variant.
    ///
    /// String payloads that are not valid UTF-8 are converted lossily.
    pub fn to_variant(&self) -> MessageVariant {
        match self.kind {
            MessageKind::String => {
                MessageVariant::String(String::from_utf8_lossy(&self.data).into_owned())
            }
            _ => MessageVariant::Binary(self.data.to_vec()),
        }
    }
}

impl From<MessageVariant> for Message {
    fn from(variant: MessageVariant) -> Self {
        match variant {
            MessageVariant::Binary(data) => Message::binary(data),
            MessageVariant::String(text) => Message::string(text),
        }
    }
}

/// Application view of a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageVariant {
    Binary(Vec<u8>),
    String(String),
}

impl MessageVariant {
    pub fn len(&self) -> usize {
        match self {
            MessageVariant::Binary(data) => data.len(),
            MessageVariant::String(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
