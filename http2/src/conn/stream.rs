//! Per-stream state.

use super::flow::FlowControl;
use crate::frame::StreamId;

/// Stream lifecycle states (RFC 7540 Section 5.1). Push-reserved states
/// are not modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent END_STREAM; the peer may still send.
    HalfClosedLocal,
    /// Peer sent END_STREAM; we may still send.
    HalfClosedRemote,
    Closed,
}

/// One HTTP/2 stream.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    flow: FlowControl,
    /// Whether a HEADERS block has already been received; a second
    /// block on the same stream carries trailers.
    saw_headers: bool,
}

impl Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            flow: FlowControl::new(send_window, recv_window),
            saw_headers: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut FlowControl {
        &mut self.flow
    }

    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Record an inbound HEADERS block; returns true when it is a
    /// trailer block (a block was seen before).
    pub fn mark_headers(&mut self) -> bool {
        let trailing = self.saw_headers;
        self.saw_headers = true;
        trailing
    }

    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_close_then_remote_close() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.can_send() && stream.can_recv());

        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.can_send() && !stream.can_recv());
    }

    #[test]
    fn remote_close_then_local_close() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(stream.can_send());
        assert!(!stream.can_recv());

        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn close_is_terminal() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        stream.reset();
        stream.send_end_stream();
        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn second_headers_block_is_trailers() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        assert!(!stream.mark_headers());
        assert!(stream.mark_headers());
        assert!(stream.mark_headers());
    }

    #[test]
    fn asymmetric_windows() {
        let stream = Stream::new(StreamId::new(1), 100, 200);
        assert_eq!(stream.flow().send_available(), 100);
    }
}
