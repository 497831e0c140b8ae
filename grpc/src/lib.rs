//! grpc - an RPC runtime over the `http2` crate.
//!
//! This crate multiplexes remote procedure calls over a single HTTP/2
//! connection per peer and exposes a tag-based completion interface:
//! applications submit batches of operations on a [`Call`] and drain
//! one [`Event`] per batch from a [`CompletionQueue`].
//!
//! # Pieces
//!
//! - [`Runtime`]: scoped library handle (timer thread, TLS init)
//! - [`CompletionQueue`]: thread-safe event stream with timed `next`
//! - [`Channel`]: client target handle, lazily connected
//! - [`Call`] / [`Batch`]: one RPC and its operation batches
//! - [`Server`]: listeners, worker pool, and incoming-call delivery
//!
//! Message payloads are opaque length-delimited bytes; serialization is
//! the application's business. All four call shapes (unary and the
//! three streaming forms) are expressed through the op sequences a
//! batch permits.
//!
//! # Example (unary client, sketch)
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//! use grpc::{Batch, Channel, CompletionQueue, CompletionType, Metadata, Runtime};
//!
//! let runtime = Runtime::new();
//! let cq = CompletionQueue::new(CompletionType::Next);
//! let channel = Channel::insecure(&runtime, "localhost:50051");
//!
//! let call = channel.create_call(
//!     &cq,
//!     "/echo.Echo/Say",
//!     None,
//!     Some(Instant::now() + Duration::from_secs(5)),
//! );
//!
//! let mut batch = Batch::new();
//! batch.send_initial_metadata(Metadata::new());
//! batch.send_message(&b"hello"[..]);
//! batch.send_close_from_client();
//! let _initial = batch.recv_initial_metadata();
//! let reply = batch.recv_message();
//! let status = batch.recv_status_on_client();
//! call.start_batch(batch, 1).unwrap();
//!
//! let event = cq.next(Instant::now() + Duration::from_secs(6));
//! assert_eq!(event.tag, 1);
//! let _ = (reply.take(), status.take());
//! ```

mod call;
mod channel;
mod completion;
mod compression;
mod deadline;
mod driver;
mod error;
mod message;
mod metadata;
mod runtime;
mod server;
mod status;
mod transport;

pub use call::{Batch, Call, OutputSlot};
pub use channel::Channel;
pub use completion::{CompletionQueue, CompletionType, Event, EventKind, Tag};
pub use compression::{Algorithm, compress, decompress};
pub use error::CallError;
pub use message::{MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE, MessageDecoder, encode_message};
pub use metadata::{Metadata, Timeout};
pub use runtime::{Runtime, VERSION, version};
pub use server::{CallDetails, RequestedCall, Server};
pub use status::{Code, Status};
pub use transport::{
    ChannelCredentials, PlainTransport, ServerCredentials, TlsTransport, Transport,
};
