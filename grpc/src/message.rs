//! gRPC length-prefixed message framing.
//!
//! Each message travels inside DATA frames as:
//! - 1 byte: compressed flag (0 = plain, 1 = compressed)
//! - 4 bytes: payload length, big-endian u32
//! - N bytes: payload
//!
//! A message may span several DATA frames and a DATA frame may carry
//! several messages; [`MessageDecoder`] reassembles across the splits.
//! Zero-length messages are valid and distinct from "no message".

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Length-prefix header size.
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Largest accepted message (the conventional 4 MiB default).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Frame a message for the wire.
pub fn encode_message(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.put_u8(compressed as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental reassembly of length-prefixed messages.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed DATA-frame payload bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// Returns the payload and its compressed flag, `Ok(None)` when more
    /// bytes are needed, or an error for oversized declarations.
    pub fn next_message(&mut self) -> io::Result<Option<(Bytes, bool)>> {
        if self.buffer.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let compressed = self.buffer[0] != 0;
        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message of {} bytes exceeds limit", length),
            ));
        }

        if self.buffer.len() < MESSAGE_HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(MESSAGE_HEADER_SIZE);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some((payload, compressed)))
    }

    /// True when bytes are buffered but do not yet form a message.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}
