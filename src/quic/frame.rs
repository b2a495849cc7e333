//! Message framing on QUIC streams.
//!
//! QUIC streams are plain byte pipes without SCTP's payload protocol
//! identifier, so every message is written as one or more frames:
//!
//! ```text
//! ┌──────────┬─────────────────┬───────────────────┐
//! │ Tag (1)  │ Length (4 bytes)│ Payload (N bytes) │
//! │ PPID-like│  big-endian u32 │                   │
//! └──────────┴─────────────────┴───────────────────┘
//! ```
//!
//! Large messages are split into `*Partial` frames closed by a terminal
//! frame. Zero-length messages use the `*Empty` tags so they are never
//! confused with a fragment.

use crate::error::{TransportError, TransportResult};
use crate::message::{Message, MessageKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: tag byte plus length prefix.
pub const FRAME_HEADER_LEN: usize = 5;

/// Payload bytes per frame before a message is fragmented (16 KB).
pub const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;

/// Per-frame payload type. Values match the SCTP PPIDs used by data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamFrameTag {
    Control = 50,
    String = 51,
    BinaryPartial = 52,
    Binary = 53,
    StringPartial = 54,
    StringEmpty = 56,
    BinaryEmpty = 57,
}

impl StreamFrameTag {
    pub fn is_partial(self) -> bool {
        matches!(self, StreamFrameTag::BinaryPartial | StreamFrameTag::StringPartial)
    }

    pub fn is_empty_marker(self) -> bool {
        matches!(self, StreamFrameTag::StringEmpty | StreamFrameTag::BinaryEmpty)
    }

    /// Message kind this tag reassembles into.
    pub fn kind(self) -> MessageKind {
        match self {
            StreamFrameTag::Control => MessageKind::Control,
            StreamFrameTag::String | StreamFrameTag::StringPartial | StreamFrameTag::StringEmpty => {
                MessageKind::String
            }
            StreamFrameTag::Binary
            | StreamFrameTag::BinaryPartial
            | StreamFrameTag::BinaryEmpty => MessageKind::Binary,
        }
    }
}

impl TryFrom<u8> for StreamFrameTag {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            50 => Ok(StreamFrameTag::Control),
            51 => Ok(StreamFrameTag::String),
            52 => Ok(StreamFrameTag::BinaryPartial),
            53 => Ok(StreamFrameTag::Binary),
            54 => Ok(StreamFrameTag::StringPartial),
            56 => Ok(StreamFrameTag::StringEmpty),
            57 => Ok(StreamFrameTag::BinaryEmpty),
            other => Err(TransportError::Frame(format!("Unknown frame tag {}", other))),
        }
    }
}

fn put_frame(out: &mut BytesMut, tag: StreamFrameTag, payload: &[u8]) {
    out.put_u8(tag as u8);
    // Payload lengths are bounded by the fragment size, which fits in u32.
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
}

/// Encode `message` into its frames, concatenated.
///
/// Reset messages are local notifications and cannot be sent.
pub fn encode_message(message: &Message, fragment_size: usize) -> TransportResult<Bytes> {
    let fragment_size = fragment_size.clamp(1, u32::MAX as usize);
    let (partial, terminal, empty) = match message.kind {
        MessageKind::Control => {
            if message.data.len() > u32::MAX as usize {
                return Err(TransportError::Frame(format!(
                    "Control message too large: {} bytes",
                    message.data.len()
                )));
            }
            let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + message.data.len());
            put_frame(&mut out, StreamFrameTag::Control, &message.data);
            return Ok(out.freeze());
        }
        MessageKind::String => (
            StreamFrameTag::StringPartial,
            StreamFrameTag::String,
            StreamFrameTag::StringEmpty,
        ),
        MessageKind::Binary => (
            StreamFrameTag::BinaryPartial,
            StreamFrameTag::Binary,
            StreamFrameTag::BinaryEmpty,
        ),
        MessageKind::Reset => {
            return Err(TransportError::Frame(
                "Reset notifications are not sendable".into(),
            ))
        }
    };

    if message.data.is_empty() {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN);
        put_frame(&mut out, empty, &[]);
        return Ok(out.freeze());
    }

    let frames = message.data.len().div_ceil(fragment_size);
    let mut out = BytesMut::with_capacity(message.data.len() + frames * FRAME_HEADER_LEN);
    let mut chunks = message.data.chunks(fragment_size).peekable();
    while let Some(chunk) = chunks.next() {
        let tag = if chunks.peek().is_some() { partial } else { terminal };
        put_frame(&mut out, tag, chunk);
    }
    Ok(out.freeze())
}

/// Rebuilds messages from the bytes read off one stream.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    partial: Option<(MessageKind, BytesMut)>,
    max_message_size: usize,
}

impl FrameReassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            partial: None,
            max_message_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// True when no frame or fragment run is half-received.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.partial.is_none()
    }

    /// Bytes buffered but not yet turned into a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.partial.as_ref().map_or(0, |(_, data)| data.len())
    }

    /// Next complete message, if enough bytes have arrived.
    pub fn next_message(&mut self) -> TransportResult<Option<Message>> {
        loop {
            if self.buffer.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let tag = StreamFrameTag::try_from(self.buffer[0])?;
            let len = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;

            if len > self.max_message_size {
                return Err(TransportError::Frame(format!(
                    "Frame too large: {} > {}",
                    len, self.max_message_size
                )));
            }
            if self.buffer.len() < FRAME_HEADER_LEN + len {
                return Ok(None);
            }

            self.buffer.advance(FRAME_HEADER_LEN);
            let payload = self.buffer.split_to(len);

            if tag.is_empty_marker() {
                if len != 0 {
                    return Err(TransportError::Frame(format!(
                        "Empty-message frame carries {} bytes",
                        len
                    )));
                }
                self.ensure_no_partial(tag)?;
                return Ok(Some(Message::new(tag.kind(), Bytes::new())));
            }

            if tag == StreamFrameTag::Control {
                self.ensure_no_partial(tag)?;
                return Ok(Some(Message::control(payload.freeze())));
            }

            let kind = tag.kind();
            let data = match self.partial.take() {
                Some((partial_kind, mut data)) => {
                    if partial_kind != kind {
                        return Err(TransportError::Frame(format!(
                            "{:?} frame continues a {:?} message",
                            tag, partial_kind
                        )));
                    }
                    if data.len() + payload.len() > self.max_message_size {
                        return Err(TransportError::Frame(format!(
                            "Message exceeds {} bytes",
                            self.max_message_size
                        )));
                    }
                    data.extend_from_slice(&payload);
                    data
                }
                None => payload,
            };

            if tag.is_partial() {
                self.partial = Some((kind, data));
                continue;
            }
            return Ok(Some(Message::new(kind, data.freeze())));
        }
    }

    fn ensure_no_partial(&self, tag: StreamFrameTag) -> TransportResult<()> {
        match &self.partial {
            Some((kind, _)) => Err(TransportError::Frame(format!(
                "{:?} frame interrupts a fragmented {:?} message",
                tag, kind
            ))),
            None => Ok(()),
        }
    }
}
