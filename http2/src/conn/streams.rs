//! The per-connection stream table.

use std::collections::HashMap;

use super::stream::Stream;
use crate::frame::StreamId;

/// Owns the streams of one connection and enforces identifier rules:
/// locally-initiated ids ascend strictly by two, and remotely-initiated
/// ids must arrive odd (client-initiated) and strictly increasing.
#[derive(Debug)]
pub struct StreamMap {
    streams: HashMap<u32, Stream>,
    /// Next id for a locally-initiated stream (1 on clients, 2 on
    /// servers).
    next_local: u32,
    /// Highest remotely-initiated id seen.
    highest_remote: u32,
}

impl StreamMap {
    pub fn new(first_local_id: u32) -> Self {
        debug_assert!(first_local_id == 1 || first_local_id == 2);
        Self {
            streams: HashMap::new(),
            next_local: first_local_id,
            highest_remote: 0,
        }
    }

    /// Open a locally-initiated stream. Ids are strictly monotonic.
    pub fn allocate(&mut self, send_window: u32, recv_window: u32) -> StreamId {
        let id = StreamId::new(self.next_local);
        self.next_local += 2;
        self.streams
            .insert(id.value(), Stream::new(id, send_window, recv_window));
        id
    }

    /// Admit a remotely-initiated stream. Returns `None` when the id is
    /// not a legal new client stream (even, reused, or regressing).
    pub fn accept_remote(
        &mut self,
        id: StreamId,
        send_window: u32,
        recv_window: u32,
    ) -> Option<&mut Stream> {
        if !id.is_client_initiated() || id.value() <= self.highest_remote {
            return None;
        }
        self.highest_remote = id.value();
        Some(
            self.streams
                .entry(id.value())
                .or_insert_with(|| Stream::new(id, send_window, recv_window)),
        )
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id.value())
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id.value())
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.streams.remove(&id.value())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta to every stream's send
    /// window.
    pub fn adjust_send_windows(&mut self, delta: i64) {
        for stream in self.streams.values_mut() {
            stream.flow_mut().adjust_send(delta);
        }
    }

    /// Remove locally-initiated streams above `last`, as required after
    /// GOAWAY. Returns the removed ids.
    pub fn drain_above(&mut self, last: StreamId, local_parity: u32) -> Vec<StreamId> {
        let doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| id > last.value() && id % 2 == local_parity)
            .collect();
        let mut ids = Vec::with_capacity(doomed.len());
        for id in doomed {
            self.streams.remove(&id);
            ids.push(StreamId::new(id));
        }
        ids.sort();
        ids
    }
}
