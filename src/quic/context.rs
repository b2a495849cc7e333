//! Per-connection and per-stream bookkeeping.
//!
//! Logical stream ids are what channels and the application see; native ids
//! are the engine's handles. The two maps form a bijection for as long as the
//! native stream lives and are always updated together.

use super::engine::NativeStreamId;
use super::frame::FrameReassembler;
use std::collections::HashMap;

/// Per-stream scratch state.
#[derive(Debug)]
pub struct StreamContext {
    pub id: u16,
    pub native: NativeStreamId,
    pub reassembler: FrameReassembler,
}

/// Connection-wide stream table.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Next logical id; `None` once the 16-bit space is used up.
    next_id: Option<u16>,
    by_id: HashMap<u16, NativeStreamId>,
    by_native: HashMap<NativeStreamId, u16>,
    streams: HashMap<u16, StreamContext>,
    max_message_size: usize,
}

impl ConnectionContext {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            next_id: Some(0),
            by_id: HashMap::new(),
            by_native: HashMap::new(),
            streams: HashMap::new(),
            max_message_size,
        }
    }

    /// Map `native` to a fresh logical id.
    ///
    /// Returns the existing id if `native` is already mapped, `None` if the
    /// id space is exhausted.
    pub fn allocate(&mut self, native: NativeStreamId) -> Option<u16> {
        if let Some(id) = self.by_native.get(&native) {
            return Some(*id);
        }
        let id = self.next_id?;
        self.next_id = id.checked_add(1);

        self.by_id.insert(id, native);
        self.by_native.insert(native, id);
        self.streams.insert(
            id,
            StreamContext {
                id,
                native,
                reassembler: FrameReassembler::new(self.max_message_size),
            },
        );
        log::debug!("Stream {} mapped to native {}", id, native);
        Some(id)
    }

    pub fn logical(&self, native: NativeStreamId) -> Option<u16> {
        self.by_native.get(&native).copied()
    }

    pub fn native(&self, id: u16) -> Option<NativeStreamId> {
        self.by_id.get(&id).copied()
    }

    pub fn stream_mut(&mut self, id: u16) -> Option<&mut StreamContext> {
        self.streams.get_mut(&id)
    }

    /// Unmap `id` in both directions and drop its stream context.
    pub fn remove(&mut self, id: u16) -> Option<StreamContext> {
        let native = self.by_id.remove(&id)?;
        self.by_native.remove(&native);
        let stream = self.streams.remove(&id)?;
        log::debug!("Stream {} unmapped (native {})", id, native);
        Some(stream)
    }

    /// Unmap every stream. Returns the logical ids that were live.
    pub fn clear(&mut self) -> Vec<u16> {
        let ids: Vec<u16> = self.by_id.keys().copied().collect();
        self.by_id.clear();
        self.by_native.clear();
        self.streams.clear();
        ids
    }

    pub fn contains(&self, id: u16) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Entries in (id → native, native → id).
    pub fn map_sizes(&self) -> (usize, usize) {
        (self.by_id.len(), self.by_native.len())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
