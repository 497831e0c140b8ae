//! http2 - sans-io HTTP/2 protocol implementation.
//!
//! This crate implements the HTTP/2 wire protocol (RFC 7540) and the
//! HPACK header coding subset (RFC 7541) used by the RPC runtime built
//! on top of it. It performs no I/O and takes no locks: callers feed
//! received bytes into a connection engine, drain the bytes the engine
//! wants written, and observe protocol activity through polled events.
//!
//! # Architecture
//!
//! - `frame`: frame types, encoding, and decoding
//! - `hpack`: header block coding (literal representations, static table)
//! - `conn`: client and server connection engines, streams, flow control
//!
//! Threading, sockets, TLS, and timers belong to the caller.

pub mod conn;
pub mod frame;
pub mod hpack;

pub use frame::{
    CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, ErrorCode, FRAME_HEADER_SIZE, Frame, FrameDecoder, FrameEncoder,
    FrameError, StreamId,
};

pub use hpack::{HeaderField, HpackError};

pub use conn::{
    ConnEvent, Connection, ConnectionError, ConnectionSettings, ConnectionState, FlowControl,
    FlowError, ServerConnection, Stream, StreamState,
};
