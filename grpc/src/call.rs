//! Calls and operation batches.
//!
//! A [`Call`] owns one HTTP/2 stream for its lifetime. Applications
//! drive it by submitting a [`Batch`] of operations with a tag; when
//! every operation in the batch has observably completed, exactly one
//! event carrying that tag appears on the call's completion queue. The
//! event reports `success: false` when any operation failed through
//! cancellation, deadline expiry, transport failure, or (on clients) a
//! non-OK terminal status.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http2::{ErrorCode, HeaderField, StreamId};
use parking_lot::Mutex;
use tracing::trace;

use crate::completion::{CompletionQueue, Event, Tag};
use crate::compression::{self, Algorithm};
use crate::driver::{ConnDriver, SendWork};
use crate::error::CallError;
use crate::message::{MessageDecoder, encode_message};
use crate::metadata::{Metadata, Timeout};
use crate::status::{Code, Status};

/// Which end of the RPC this call lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Shared cell a receive operation writes its result into. The
/// application reads it with [`take`](OutputSlot::take) after the
/// batch's event is drained.
pub struct OutputSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for OutputSlot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Default for OutputSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputSlot<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    pub fn take(&self) -> Option<T> {
        self.cell.lock().take()
    }

    pub(crate) fn put(&self, value: T) {
        *self.cell.lock() = Some(value);
    }
}

/// Tracks one submitted batch: counts outstanding operation units and
/// aggregates failure, emitting the single completion event when the
/// last unit lands.
pub(crate) struct BatchCompletion {
    tag: Tag,
    cq: CompletionQueue,
    remaining: AtomicUsize,
    failed: AtomicBool,
}

impl BatchCompletion {
    fn new(tag: Tag, cq: CompletionQueue, units: usize) -> Arc<Self> {
        debug_assert!(units > 0);
        Arc::new(Self {
            tag,
            cq,
            remaining: AtomicUsize::new(units),
            failed: AtomicBool::new(false),
        })
    }

    pub(crate) fn op_done(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::SeqCst);
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let success = !self.failed.load(Ordering::SeqCst);
            self.cq.push(Event::completion(self.tag, success));
        }
    }
}

/// A deferred `op_done`, collected under the call lock and fired after
/// it is released so the completion queue lock never nests inside it.
struct FiredOp {
    completion: Arc<BatchCompletion>,
    ok: bool,
}

fn fire(fired: Vec<FiredOp>) {
    for op in fired {
        op.completion.op_done(op.ok);
    }
}

/// A batch of operations for one `start_batch` submission.
///
/// Each operation kind may appear at most once. Receive operations hand
/// back an [`OutputSlot`] that holds the result once the batch event is
/// observed.
#[derive(Default)]
pub struct Batch {
    send_initial_metadata: Option<Metadata>,
    send_message: Option<Bytes>,
    send_close: bool,
    send_status: Option<(Status, Metadata)>,
    recv_initial_metadata: Option<OutputSlot<Metadata>>,
    recv_message: Option<OutputSlot<Option<Bytes>>>,
    recv_status: Option<OutputSlot<(Status, Metadata)>>,
    recv_close: Option<OutputSlot<bool>>,
    duplicate: bool,
    op_count: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_initial_metadata(&mut self, metadata: Metadata) -> &mut Self {
        self.duplicate |= self.send_initial_metadata.is_some();
        self.send_initial_metadata = Some(metadata);
        self.op_count += 1;
        self
    }

    pub fn send_message(&mut self, payload: impl Into<Bytes>) -> &mut Self {
        self.duplicate |= self.send_message.is_some();
        self.send_message = Some(payload.into());
        self.op_count += 1;
        self
    }

    /// Half-close the client's sending direction.
    pub fn send_close_from_client(&mut self) -> &mut Self {
        self.duplicate |= self.send_close;
        self.send_close = true;
        self.op_count += 1;
        self
    }

    /// Terminate the RPC from the server with a status and trailing
    /// metadata.
    pub fn send_status_from_server(&mut self, status: Status, trailing: Metadata) -> &mut Self {
        self.duplicate |= self.send_status.is_some();
        self.send_status = Some((status, trailing));
        self.op_count += 1;
        self
    }

    pub fn recv_initial_metadata(&mut self) -> OutputSlot<Metadata> {
        self.duplicate |= self.recv_initial_metadata.is_some();
        let slot = OutputSlot::new();
        self.recv_initial_metadata = Some(slot.clone());
        self.op_count += 1;
        slot
    }

    /// Receive one message. The slot holds `Some(payload)` for a
    /// message (possibly zero-length) or `None` when the peer finished
    /// without another message.
    pub fn recv_message(&mut self) -> OutputSlot<Option<Bytes>> {
        self.duplicate |= self.recv_message.is_some();
        let slot = OutputSlot::new();
        self.recv_message = Some(slot.clone());
        self.op_count += 1;
        slot
    }

    /// Receive the terminal status and trailing metadata (client only).
    pub fn recv_status_on_client(&mut self) -> OutputSlot<(Status, Metadata)> {
        self.duplicate |= self.recv_status.is_some();
        let slot = OutputSlot::new();
        self.recv_status = Some(slot.clone());
        self.op_count += 1;
        slot
    }

    /// Observe the client closing its sending direction (server only).
    /// The slot holds `true` when the call was cancelled rather than
    /// completed.
    pub fn recv_close_on_server(&mut self) -> OutputSlot<bool> {
        self.duplicate |= self.recv_close.is_some();
        let slot = OutputSlot::new();
        self.recv_close = Some(slot.clone());
        self.op_count += 1;
        slot
    }

    fn has_send(&self) -> bool {
        self.send_initial_metadata.is_some()
            || self.send_message.is_some()
            || self.send_close
            || self.send_status.is_some()
    }

    fn has_recv(&self) -> bool {
        self.recv_initial_metadata.is_some()
            || self.recv_message.is_some()
            || self.recv_status.is_some()
            || self.recv_close.is_some()
    }
}

/// Local send progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing sent yet.
    Init,
    /// Initial metadata sent (or queued); messages may follow.
    MetadataSent,
    /// Our direction is closed: client sent close, or server sent
    /// status.
    HalfClosedLocal,
}

/// Pending receive operations of the in-flight recv batch.
struct RecvOps {
    completion: Arc<BatchCompletion>,
    initial_metadata: Option<OutputSlot<Metadata>>,
    message: Option<OutputSlot<Option<Bytes>>>,
    status: Option<OutputSlot<(Status, Metadata)>>,
    close: Option<OutputSlot<bool>>,
}

impl RecvOps {
    fn is_drained(&self) -> bool {
        self.initial_metadata.is_none()
            && self.message.is_none()
            && self.status.is_none()
            && self.close.is_none()
    }
}

pub(crate) struct CallState {
    phase: Phase,
    cancelled: bool,
    /// Terminal status with trailing metadata; set at most once.
    status: Option<(Status, Metadata)>,
    peer_initial_metadata: Option<Metadata>,
    messages: VecDeque<Bytes>,
    decoder: MessageDecoder,
    recv_closed: bool,
    inbound_encoding: Algorithm,
    outbound_encoding: Algorithm,
    send_inflight: bool,
    recv_ops: Option<RecvOps>,
}

impl CallState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            cancelled: false,
            status: None,
            peer_initial_metadata: None,
            messages: VecDeque::new(),
            decoder: MessageDecoder::new(),
            recv_closed: false,
            inbound_encoding: Algorithm::Identity,
            outbound_encoding: Algorithm::Identity,
            send_inflight: false,
            recv_ops: None,
        }
    }
}

pub(crate) struct CallShared {
    pub(crate) side: Side,
    pub(crate) method: String,
    pub(crate) host: Option<String>,
    pub(crate) deadline: Option<Instant>,
    /// `None` when the owning channel never reached the peer; batches
    /// then complete immediately as failed.
    pub(crate) wire: Option<Arc<ConnDriver>>,
    pub(crate) stream_id: StreamId,
    pub(crate) cq: Mutex<Option<CompletionQueue>>,
    pub(crate) state: Mutex<CallState>,
}

/// One RPC in flight.
pub struct Call {
    shared: Arc<CallShared>,
}

impl Call {
    pub(crate) fn client(
        wire: Option<Arc<ConnDriver>>,
        stream_id: StreamId,
        cq: CompletionQueue,
        method: &str,
        host: Option<&str>,
        deadline: Option<Instant>,
    ) -> (Self, Arc<CallShared>) {
        let shared = Arc::new(CallShared {
            side: Side::Client,
            method: method.to_string(),
            host: host.map(str::to_string),
            deadline,
            wire,
            stream_id,
            cq: Mutex::new(Some(cq)),
            state: Mutex::new(CallState::new()),
        });
        (Self { shared: shared.clone() }, shared)
    }

    pub(crate) fn server(
        wire: Arc<ConnDriver>,
        stream_id: StreamId,
        method: String,
        host: Option<String>,
        deadline: Option<Instant>,
        request_metadata: Metadata,
        recv_closed: bool,
    ) -> (Self, Arc<CallShared>) {
        let mut state = CallState::new();
        state.inbound_encoding = request_metadata
            .get_str("grpc-encoding")
            .and_then(Algorithm::from_name)
            .unwrap_or(Algorithm::Identity);
        state.peer_initial_metadata = Some(request_metadata);
        state.recv_closed = recv_closed;

        let shared = Arc::new(CallShared {
            side: Side::Server,
            method,
            host,
            deadline,
            wire: Some(wire),
            stream_id,
            cq: Mutex::new(None),
            state: Mutex::new(state),
        });
        (Self { shared: shared.clone() }, shared)
    }

    pub fn method(&self) -> &str {
        &self.shared.method
    }

    pub fn host(&self) -> Option<&str> {
        self.shared.host.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Compress outgoing messages with `algorithm`. Must be set before
    /// the first batch that sends a message.
    pub fn set_compression(&self, algorithm: Algorithm) {
        self.shared.state.lock().outbound_encoding = algorithm;
    }

    /// Submit a batch of operations; the event for `tag` appears on the
    /// call's completion queue once every operation has completed.
    pub fn start_batch(&self, batch: Batch, tag: Tag) -> Result<(), CallError> {
        self.shared.start_batch(batch, tag)
    }

    /// Cancel the call. Idempotent and safe from any thread; pending
    /// batches complete with `success: false`.
    pub fn cancel(&self) {
        self.shared
            .cancel_with(Status::cancelled("call cancelled"));
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.shared.on_handle_dropped();
    }
}

impl CallShared {
    fn cq(&self) -> Option<CompletionQueue> {
        self.cq.lock().clone()
    }

    pub(crate) fn bind_cq(&self, cq: CompletionQueue) {
        *self.cq.lock() = Some(cq);
    }

    fn start_batch(self: &Arc<Self>, batch: Batch, tag: Tag) -> Result<(), CallError> {
        let cq = self.cq().ok_or(CallError::Error)?;

        if batch.duplicate {
            return Err(CallError::TooManyOps);
        }
        match self.side {
            Side::Client => {
                if batch.send_status.is_some() || batch.recv_close.is_some() {
                    return Err(CallError::NotOnClient);
                }
            }
            Side::Server => {
                if batch.send_close || batch.recv_status.is_some() {
                    return Err(CallError::NotOnServer);
                }
            }
        }

        cq.register_pluck_tag(tag);

        if batch.op_count == 0 {
            cq.push(Event::completion(tag, true));
            return Ok(());
        }

        let has_send = batch.has_send();
        let has_recv = batch.has_recv();

        let mut state = self.state.lock();

        // A dead call (broken channel, cancelled, expired) accepts the
        // batch and fails it asynchronously with the terminal status.
        if self.wire.is_none() || state.cancelled {
            let (status, trailing) = state
                .status
                .clone()
                .unwrap_or_else(|| (Status::unavailable("channel disconnected"), Metadata::new()));
            fill_slots_terminal(&batch, &state, &status, &trailing);
            drop(state);
            cq.push(Event::completion(tag, false));
            return Ok(());
        }

        if state.status.is_some() && has_send {
            return Err(CallError::AlreadyFinished);
        }
        if has_send && state.send_inflight {
            return Err(CallError::TooManyOps);
        }
        if has_recv && state.recv_ops.is_some() {
            return Err(CallError::TooManyOps);
        }
        if batch.send_initial_metadata.is_some() && state.phase != Phase::Init {
            return Err(CallError::AlreadyInvoked);
        }
        if has_send && state.phase == Phase::HalfClosedLocal {
            return Err(CallError::AlreadyFinished);
        }
        if (batch.send_message.is_some() || batch.send_close || batch.send_status.is_some())
            && state.phase == Phase::Init
            && batch.send_initial_metadata.is_none()
        {
            return Err(CallError::NotInvoked);
        }

        let units = usize::from(has_send)
            + usize::from(batch.recv_initial_metadata.is_some())
            + usize::from(batch.recv_message.is_some())
            + usize::from(batch.recv_status.is_some())
            + usize::from(batch.recv_close.is_some());
        let completion = BatchCompletion::new(tag, cq, units);

        // Advance the local phase now; only one send batch can be in
        // flight, so submission order is authoritative.
        if batch.send_initial_metadata.is_some() {
            state.phase = Phase::MetadataSent;
        }
        if batch.send_close || batch.send_status.is_some() {
            state.phase = Phase::HalfClosedLocal;
        }

        let mut fired = Vec::new();
        let work = if has_send {
            let work = self.build_send_work(&batch, &mut state, completion.clone())?;
            state.send_inflight = true;
            Some(work)
        } else {
            None
        };

        if has_recv {
            state.recv_ops = Some(RecvOps {
                completion: completion.clone(),
                initial_metadata: batch.recv_initial_metadata.clone(),
                message: batch.recv_message.clone(),
                status: batch.recv_status.clone(),
                close: batch.recv_close.clone(),
            });
            satisfy_recv(&mut state, &mut fired);
        }

        // A server sending its status has locally finished the call.
        if let Some((status, trailing)) = &batch.send_status {
            finish(&mut state, status.clone(), trailing.clone(), &mut fired);
        }

        drop(state);
        fire(fired);

        if let (Some(work), Some(wire)) = (work, self.wire.as_ref()) {
            wire.queue_send(work);
        }
        Ok(())
    }

    /// Assemble the writer-thread work item for the batch's send ops.
    fn build_send_work(
        self: &Arc<Self>,
        batch: &Batch,
        state: &mut CallState,
        completion: Arc<BatchCompletion>,
    ) -> Result<SendWork, CallError> {
        let wire = self.wire.as_ref().ok_or(CallError::Error)?;

        let headers = match &batch.send_initial_metadata {
            Some(metadata) => Some(match self.side {
                Side::Client => self.request_headers(wire, metadata, state.outbound_encoding),
                Side::Server => response_headers(metadata, state.outbound_encoding),
            }),
            None => None,
        };

        let message = match &batch.send_message {
            Some(payload) => {
                let framed = if state.outbound_encoding.is_identity() {
                    encode_message(payload, false)
                } else {
                    let compressed = compression::compress(payload, state.outbound_encoding)
                        .map_err(|_| CallError::Error)?;
                    encode_message(&compressed, true)
                };
                Some(framed)
            }
            None => None,
        };

        let trailers = batch
            .send_status
            .as_ref()
            .map(|(status, trailing)| trailer_fields(status, trailing));

        Ok(SendWork {
            call: Arc::downgrade(self),
            stream_id: self.stream_id,
            headers,
            message,
            trailers,
            end_stream: batch.send_close,
            completion,
        })
    }

    fn request_headers(
        &self,
        wire: &Arc<ConnDriver>,
        metadata: &Metadata,
        encoding: Algorithm,
    ) -> Vec<HeaderField> {
        let scheme: &[u8] = if wire.is_tls() { b"https" } else { b"http" };
        let authority = self
            .host
            .clone()
            .unwrap_or_else(|| wire.authority().to_string());

        let mut fields = vec![
            HeaderField::new(":method", "POST"),
            HeaderField::new(":scheme", scheme),
            HeaderField::new(":path", self.method.as_bytes()),
            HeaderField::new(":authority", authority.into_bytes()),
            HeaderField::new("te", "trailers"),
            HeaderField::new("content-type", "application/grpc"),
        ];
        if !encoding.is_identity() {
            fields.push(HeaderField::new("grpc-encoding", encoding.name()));
        }
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            fields.push(HeaderField::new(
                "grpc-timeout",
                Timeout::from_duration(remaining).to_wire().into_bytes(),
            ));
        }
        append_user_metadata(&mut fields, metadata);
        fields
    }

    /// Deliver peer initial metadata (client receives response headers;
    /// unused on servers, whose request metadata arrives at creation).
    pub(crate) fn on_initial_metadata(&self, metadata: Metadata) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.inbound_encoding = metadata
                .get_str("grpc-encoding")
                .and_then(Algorithm::from_name)
                .unwrap_or(Algorithm::Identity);
            state.peer_initial_metadata = Some(metadata);
            satisfy_recv(&mut state, &mut fired);
        }
        fire(fired);
    }

    /// Deliver DATA payload bytes.
    pub(crate) fn on_data(&self, data: &[u8], end_stream: bool) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.decoder.feed(data);
            loop {
                match state.decoder.next_message() {
                    Ok(Some((payload, compressed))) => {
                        if compressed {
                            match compression::decompress(&payload, state.inbound_encoding) {
                                Ok(decoded) => state.messages.push_back(decoded),
                                Err(err) => {
                                    trace!(error = %err, "failed to decompress message");
                                    finish(
                                        &mut state,
                                        Status::internal("corrupt compressed message"),
                                        Metadata::new(),
                                        &mut fired,
                                    );
                                    break;
                                }
                            }
                        } else {
                            state.messages.push_back(payload);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        trace!(error = %err, "malformed message frame");
                        finish(
                            &mut state,
                            Status::internal("malformed length-prefixed message"),
                            Metadata::new(),
                            &mut fired,
                        );
                        break;
                    }
                }
            }

            if end_stream {
                state.recv_closed = true;
                if state.decoder.has_partial() && state.status.is_none() {
                    finish(
                        &mut state,
                        Status::internal("stream ended inside a message"),
                        Metadata::new(),
                        &mut fired,
                    );
                }
            }

            satisfy_recv(&mut state, &mut fired);

            // A client stream that ends without trailers never produced
            // a status.
            if end_stream && self.side == Side::Client && state.status.is_none() {
                finish(
                    &mut state,
                    Status::new(Code::Unknown, "stream closed without grpc-status"),
                    Metadata::new(),
                    &mut fired,
                );
            }
        }
        fire(fired);
    }

    /// Deliver trailers: the terminal status of a client call.
    pub(crate) fn on_trailers(&self, status: Status, trailing: Metadata) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.recv_closed = true;
            finish(&mut state, status, trailing, &mut fired);
        }
        fire(fired);
    }

    /// Peer reset the stream.
    pub(crate) fn on_reset(&self, error: ErrorCode) {
        let status = match error {
            ErrorCode::Cancel => Status::cancelled("stream reset by peer"),
            ErrorCode::EnhanceYourCalm => {
                Status::new(Code::ResourceExhausted, "stream reset by peer")
            }
            ErrorCode::InadequateSecurity => {
                Status::new(Code::PermissionDenied, "stream reset by peer")
            }
            _ => Status::unavailable(format!("stream reset by peer: {}", error)),
        };
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.recv_closed = true;
            finish(&mut state, status, Metadata::new(), &mut fired);
        }
        fire(fired);
    }

    /// The connection died underneath the call.
    pub(crate) fn fail(&self, status: Status) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.recv_closed = true;
            finish(&mut state, status, Metadata::new(), &mut fired);
        }
        fire(fired);
    }

    /// Deadline timer callback.
    pub(crate) fn expire_deadline(&self) {
        self.cancel_with(Status::deadline_exceeded("deadline exceeded"));
    }

    pub(crate) fn cancel_with(&self, status: Status) {
        let newly_terminal = {
            let mut state = self.state.lock();
            state.cancelled = true;
            let mut fired = Vec::new();
            let was_unset = state.status.is_none();
            finish(&mut state, status, Metadata::new(), &mut fired);
            drop(state);
            fire(fired);
            was_unset
        };

        if newly_terminal && let Some(wire) = &self.wire {
            wire.reset_stream(self.stream_id, ErrorCode::Cancel);
        }
    }

    /// True once nothing should be sent for this call anymore.
    pub(crate) fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.status.is_some()
    }

    /// Cancellation check for the writer thread. Distinct from
    /// [`is_terminated`](Self::is_terminated): a server call carries
    /// its own sent status before the trailers hit the wire, and those
    /// trailers must still go out.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Writer-thread callback once the batch's send unit has executed
    /// (or failed); a new send batch may be submitted.
    pub(crate) fn on_send_done(&self) {
        self.state.lock().send_inflight = false;
    }

    fn on_handle_dropped(&self) {
        if let Some(wire) = &self.wire {
            if !self.is_terminated() {
                wire.reset_stream(self.stream_id, ErrorCode::Cancel);
            }
            wire.remove_call(self.stream_id);
        }
    }
}

/// Complete whatever receive operations the buffered state can satisfy.
fn satisfy_recv(state: &mut CallState, fired: &mut Vec<FiredOp>) {
    let Some(ops) = &mut state.recv_ops else {
        return;
    };

    if let Some(slot) = &ops.initial_metadata
        && let Some(metadata) = &state.peer_initial_metadata
    {
        slot.put(metadata.clone());
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok: true,
        });
        ops.initial_metadata = None;
    }

    if let Some(slot) = &ops.message {
        if let Some(payload) = state.messages.pop_front() {
            slot.put(Some(payload));
            fired.push(FiredOp {
                completion: ops.completion.clone(),
                ok: true,
            });
            ops.message = None;
        } else if state.recv_closed {
            slot.put(None);
            fired.push(FiredOp {
                completion: ops.completion.clone(),
                ok: true,
            });
            ops.message = None;
        }
    }

    if let Some(slot) = &ops.close
        && state.recv_closed
    {
        slot.put(state.cancelled);
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok: !state.cancelled,
        });
        ops.close = None;
    }

    if let Some(slot) = &ops.status
        && let Some((status, trailing)) = &state.status
    {
        slot.put((status.clone(), trailing.clone()));
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok: status.is_ok(),
        });
        ops.status = None;
    }

    if ops.is_drained() {
        state.recv_ops = None;
    }
}

/// Record the terminal status (at most once) and flush every pending
/// receive operation.
fn finish(state: &mut CallState, status: Status, trailing: Metadata, fired: &mut Vec<FiredOp>) {
    if state.status.is_some() {
        return;
    }
    let ok = status.is_ok();
    state.status = Some((status, trailing));

    let Some(ops) = &mut state.recv_ops else {
        return;
    };

    if let Some(slot) = ops.initial_metadata.take() {
        slot.put(state.peer_initial_metadata.clone().unwrap_or_default());
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok,
        });
    }
    if let Some(slot) = ops.message.take() {
        match state.messages.pop_front() {
            Some(payload) => {
                slot.put(Some(payload));
                fired.push(FiredOp {
                    completion: ops.completion.clone(),
                    ok: true,
                });
            }
            None => {
                slot.put(None);
                fired.push(FiredOp {
                    completion: ops.completion.clone(),
                    ok,
                });
            }
        }
    }
    if let Some(slot) = ops.close.take() {
        slot.put(state.cancelled);
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok: !state.cancelled,
        });
    }
    if let Some(slot) = ops.status.take() {
        let (status, trailing) = state.status.clone().unwrap_or_else(|| {
            (Status::unavailable("no status"), Metadata::new())
        });
        slot.put((status, trailing));
        fired.push(FiredOp {
            completion: ops.completion.clone(),
            ok,
        });
    }
    state.recv_ops = None;
}

/// Fill a dead call's batch slots so the application still observes the
/// terminal status.
fn fill_slots_terminal(batch: &Batch, state: &CallState, status: &Status, trailing: &Metadata) {
    if let Some(slot) = &batch.recv_initial_metadata {
        slot.put(state.peer_initial_metadata.clone().unwrap_or_default());
    }
    if let Some(slot) = &batch.recv_message {
        slot.put(None);
    }
    if let Some(slot) = &batch.recv_status {
        slot.put((status.clone(), trailing.clone()));
    }
    if let Some(slot) = &batch.recv_close {
        slot.put(true);
    }
}

/// Server response headers for the initial metadata op.
fn response_headers(metadata: &Metadata, encoding: Algorithm) -> Vec<HeaderField> {
    let mut fields = vec![
        HeaderField::new(":status", "200"),
        HeaderField::new("content-type", "application/grpc"),
    ];
    if !encoding.is_identity() {
        fields.push(HeaderField::new("grpc-encoding", encoding.name()));
    }
    append_user_metadata(&mut fields, metadata);
    fields
}

/// Trailer block carrying `grpc-status` and optional `grpc-message`.
fn trailer_fields(status: &Status, trailing: &Metadata) -> Vec<HeaderField> {
    let mut fields = vec![HeaderField::new(
        "grpc-status",
        status.status_trailer().into_bytes(),
    )];
    if let Some(message) = status.message_trailer() {
        fields.push(HeaderField::new("grpc-message", message));
    }
    append_user_metadata(&mut fields, trailing);
    fields
}

fn append_user_metadata(fields: &mut Vec<HeaderField>, metadata: &Metadata) {
    for (key, value) in metadata.iter() {
        if key.starts_with(':') || RESERVED_KEYS.contains(&key) {
            continue;
        }
        fields.push(HeaderField::new(key.as_bytes(), value));
    }
}

const RESERVED_KEYS: &[&str] = &[
    "te",
    "content-type",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-status",
    "grpc-message",
];

/// Parse a client's request header block into call parameters.
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) host: Option<String>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) metadata: Metadata,
}

pub(crate) fn parse_request_head(fields: &[HeaderField]) -> Option<RequestHead> {
    let mut method = None;
    let mut host = None;
    let mut deadline = None;
    let mut metadata = Metadata::new();

    for field in fields {
        let name = std::str::from_utf8(&field.name).ok()?;
        match name {
            ":path" => method = Some(String::from_utf8(field.value.clone()).ok()?),
            ":authority" => host = String::from_utf8(field.value.clone()).ok(),
            "grpc-timeout" => {
                deadline = std::str::from_utf8(&field.value)
                    .ok()
                    .and_then(Timeout::parse)
                    .map(|t| Instant::now() + t.as_duration());
            }
            _ if name.starts_with(':') || name == "te" || name == "content-type" => {}
            _ => metadata.add(name, field.value.clone()),
        }
    }

    method.map(|method| RequestHead {
        method,
        host,
        deadline,
        metadata,
    })
}

/// Extract status and trailing metadata from a trailer block.
pub(crate) fn parse_trailers(fields: &[HeaderField]) -> (Status, Metadata) {
    let mut grpc_status = None;
    let mut grpc_message = None;
    let mut trailing = Metadata::new();

    for field in fields {
        match field.name.as_slice() {
            b"grpc-status" => grpc_status = Some(field.value.as_slice()),
            b"grpc-message" => grpc_message = Some(field.value.as_slice()),
            name if name.starts_with(b":") => {}
            name => {
                if let Ok(key) = std::str::from_utf8(name) {
                    trailing.add(key, field.value.clone());
                }
            }
        }
    }

    (
        Status::from_trailers(grpc_status, grpc_message),
        trailing,
    )
}

/// Convert a header block that is NOT a trailer into metadata,
/// dropping transport-level fields.
pub(crate) fn headers_to_metadata(fields: &[HeaderField]) -> Metadata {
    let mut metadata = Metadata::new();
    for field in fields {
        if field.name.starts_with(b":") {
            continue;
        }
        if let Ok(key) = std::str::from_utf8(&field.name) {
            metadata.add(key, field.value.clone());
        }
    }
    metadata
}
