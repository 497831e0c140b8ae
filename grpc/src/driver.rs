//! Connection drivers.
//!
//! A [`ConnDriver`] owns one transport plus its sans-io engine and runs
//! the two threads that animate them: a reader that feeds received
//! bytes into the engine and dispatches the resulting events to calls,
//! and a writer that executes queued send work, blocking on flow
//! control when the windows are empty.
//!
//! Locking: the write lock is held only for the duration of one frame
//! batch hitting the transport; the engine lock is only ever taken
//! alone or inside the write lock; call locks are taken strictly after
//! both are released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http2::{
    ConnEvent, Connection, ConnectionError, ErrorCode, HeaderField, ServerConnection, StreamId,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::call::{self, BatchCompletion, CallShared};
use crate::status::Status;
use crate::transport::Transport;

/// Role-tagged sans-io engine.
pub(crate) enum Engine {
    Client(Connection),
    Server(ServerConnection),
}

impl Engine {
    fn recv(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self {
            Engine::Client(conn) => conn.recv(data),
            Engine::Server(conn) => conn.recv(data),
        }
    }

    fn take_write_buf(&mut self) -> Bytes {
        match self {
            Engine::Client(conn) => conn.take_write_buf(),
            Engine::Server(conn) => conn.take_write_buf(),
        }
    }

    fn poll_events(&mut self) -> Vec<ConnEvent> {
        match self {
            Engine::Client(conn) => conn.poll_events(),
            Engine::Server(conn) => conn.poll_events(),
        }
    }

    fn send_headers(
        &mut self,
        stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        match self {
            Engine::Client(conn) => conn.send_headers(stream_id, fields, end_stream),
            Engine::Server(conn) => conn.send_headers(stream_id, fields, end_stream),
        }
    }

    fn send_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize, ConnectionError> {
        match self {
            Engine::Client(conn) => conn.send_data(stream_id, data, end_stream),
            Engine::Server(conn) => conn.send_data(stream_id, data, end_stream),
        }
    }

    fn open_stream(&mut self) -> Result<StreamId, ConnectionError> {
        match self {
            Engine::Client(conn) => conn.open_stream(),
            Engine::Server(_) => Err(ConnectionError::NotReady),
        }
    }

    fn reset_stream(&mut self, stream_id: StreamId, error: ErrorCode) {
        match self {
            Engine::Client(conn) => conn.reset_stream(stream_id, error),
            Engine::Server(conn) => conn.reset_stream(stream_id, error),
        }
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        match self {
            Engine::Client(conn) => conn.remove_stream(stream_id),
            Engine::Server(conn) => conn.remove_stream(stream_id),
        }
    }

    fn close(&mut self) {
        match self {
            Engine::Client(conn) => conn.close(),
            Engine::Server(conn) => conn.close(),
        }
    }
}

/// The send half of one batch, executed in order by the writer thread.
pub(crate) struct SendWork {
    pub(crate) call: Weak<CallShared>,
    pub(crate) stream_id: StreamId,
    /// Initial metadata as ready-to-encode header fields.
    pub(crate) headers: Option<Vec<HeaderField>>,
    /// Length-prefixed (and possibly compressed) message bytes.
    pub(crate) message: Option<Bytes>,
    /// Server trailer fields; always close the stream.
    pub(crate) trailers: Option<Vec<HeaderField>>,
    /// Client half-close.
    pub(crate) end_stream: bool,
    pub(crate) completion: Arc<BatchCompletion>,
}

/// Receives client-initiated streams on server connections.
pub(crate) trait RequestSink: Send + Sync {
    fn deliver(
        &self,
        driver: &Arc<ConnDriver>,
        stream_id: StreamId,
        head: call::RequestHead,
        end_stream: bool,
    );
}

enum ReadyFlag {
    Pending,
    Ready,
    Failed,
}

struct SendQueue {
    items: VecDeque<SendWork>,
    shutdown: bool,
}

pub(crate) struct ConnDriver {
    transport: Arc<dyn Transport>,
    engine: Mutex<Engine>,
    /// Serializes transport writes so queued frames hit the wire in
    /// the order they were encoded.
    write_lock: Mutex<()>,
    sendq: Mutex<SendQueue>,
    send_cv: Condvar,
    /// Writer threads park here when flow control blocks a DATA frame;
    /// the reader notifies after every inbound batch.
    window: Mutex<()>,
    window_cv: Condvar,
    calls: Mutex<HashMap<u32, Weak<CallShared>>>,
    broken: AtomicBool,
    ready: Mutex<ReadyFlag>,
    ready_cv: Condvar,
    authority: String,
    tls: bool,
    sink: Option<Arc<dyn RequestSink>>,
}

impl ConnDriver {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        engine: Engine,
        authority: String,
        tls: bool,
        sink: Option<Arc<dyn RequestSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            engine: Mutex::new(engine),
            write_lock: Mutex::new(()),
            sendq: Mutex::new(SendQueue {
                items: VecDeque::new(),
                shutdown: false,
            }),
            send_cv: Condvar::new(),
            window: Mutex::new(()),
            window_cv: Condvar::new(),
            calls: Mutex::new(HashMap::new()),
            broken: AtomicBool::new(false),
            ready: Mutex::new(ReadyFlag::Pending),
            ready_cv: Condvar::new(),
            authority,
            tls,
            sink,
        })
    }

    pub(crate) fn authority(&self) -> &str {
        &self.authority
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.tls
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Spawn the reader and writer threads (client connections).
    pub(crate) fn start(self: &Arc<Self>) {
        self.spawn_writer();
        let driver = self.clone();
        std::thread::Builder::new()
            .name("grpc-conn-reader".into())
            .spawn(move || driver.run_reader())
            .expect("spawn reader thread");
    }

    /// Spawn only the writer thread; the caller runs the reader loop
    /// itself (server workers).
    pub(crate) fn spawn_writer(self: &Arc<Self>) {
        let driver = self.clone();
        std::thread::Builder::new()
            .name("grpc-conn-writer".into())
            .spawn(move || driver.run_writer())
            .expect("spawn writer thread");
    }

    /// Block until the SETTINGS exchange finishes or `timeout` passes.
    pub(crate) fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.ready.lock();
        loop {
            match *flag {
                ReadyFlag::Ready => return true,
                ReadyFlag::Failed => return false,
                ReadyFlag::Pending => {
                    if self.ready_cv.wait_until(&mut flag, deadline).timed_out() {
                        return matches!(*flag, ReadyFlag::Ready);
                    }
                }
            }
        }
    }

    pub(crate) fn open_stream(&self) -> Result<StreamId, ConnectionError> {
        self.engine.lock().open_stream()
    }

    pub(crate) fn register_call(&self, stream_id: StreamId, call: Weak<CallShared>) {
        self.calls.lock().insert(stream_id.value(), call);
    }

    pub(crate) fn remove_call(&self, stream_id: StreamId) {
        self.calls.lock().remove(&stream_id.value());
        self.engine.lock().remove_stream(stream_id);
    }

    pub(crate) fn queue_send(&self, work: SendWork) {
        if self.is_broken() {
            if let Some(call) = work.call.upgrade() {
                call.on_send_done();
            }
            work.completion.op_done(false);
            return;
        }
        self.sendq.lock().items.push_back(work);
        self.send_cv.notify_one();
    }

    /// Emit RST_STREAM and forget the stream.
    pub(crate) fn reset_stream(&self, stream_id: StreamId, error: ErrorCode) {
        let result = self.write_frames(|engine| {
            engine.reset_stream(stream_id, error);
            Ok(())
        });
        if result.is_err() {
            self.fail_connection("transport write failed");
        }
        self.calls.lock().remove(&stream_id.value());
    }

    /// Tear the connection down, failing every call on it.
    pub(crate) fn shutdown(&self) {
        self.fail_connection("connection closed");
    }

    /// Reader loop. Returns when the connection dies or is shut down.
    pub(crate) fn run_reader(self: &Arc<Self>) {
        // Handshake bytes (preface, SETTINGS) are queued at engine
        // construction and must go out before the first read.
        if self.flush_writes().is_err() {
            self.fail_connection("transport write failed");
            return;
        }

        let mut buf = vec![0u8; 16384];
        loop {
            if self.is_broken() {
                break;
            }
            match self.transport.read(&mut buf) {
                Ok(0) => {
                    self.fail_connection("connection closed by peer");
                    break;
                }
                Ok(n) => {
                    let events = {
                        let mut engine = self.engine.lock();
                        match engine.recv(&buf[..n]) {
                            Ok(()) => engine.poll_events(),
                            Err(err) => {
                                drop(engine);
                                self.fail_connection(&format!("protocol error: {}", err));
                                break;
                            }
                        }
                    };
                    // Engine replies (SETTINGS ACK, PING ACK,
                    // WINDOW_UPDATE) go out before events are acted on.
                    if self.flush_writes().is_err() {
                        self.fail_connection("transport write failed");
                        break;
                    }
                    self.dispatch(events);
                    // Any inbound frame may have replenished a send
                    // window.
                    self.window_cv.notify_all();
                }
                Err(err) => {
                    self.fail_connection(&format!("transport read failed: {}", err));
                    break;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, events: Vec<ConnEvent>) {
        for event in events {
            match event {
                ConnEvent::Ready => {
                    let mut flag = self.ready.lock();
                    if matches!(*flag, ReadyFlag::Pending) {
                        *flag = ReadyFlag::Ready;
                    }
                    self.ready_cv.notify_all();
                }
                ConnEvent::Headers {
                    stream_id,
                    fields,
                    trailing,
                    end_stream,
                } => self.dispatch_headers(stream_id, fields, trailing, end_stream),
                ConnEvent::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if let Some(call) = self.lookup(stream_id) {
                        call.on_data(&data, end_stream);
                    }
                }
                ConnEvent::StreamReset { stream_id, error } => {
                    trace!(stream = %stream_id, %error, "stream reset by peer");
                    if let Some(call) = self.lookup(stream_id) {
                        call.on_reset(error);
                    }
                    self.calls.lock().remove(&stream_id.value());
                }
                ConnEvent::GoAway {
                    last_stream_id,
                    error,
                } => {
                    debug!(last_stream = %last_stream_id, %error, "peer sent GOAWAY");
                }
            }
        }
    }

    fn dispatch_headers(
        self: &Arc<Self>,
        stream_id: StreamId,
        fields: Vec<HeaderField>,
        trailing: bool,
        end_stream: bool,
    ) {
        if let Some(call) = self.lookup(stream_id) {
            if trailing || end_stream {
                if self.sink.is_none() {
                    // Client side: trailers (or a trailers-only
                    // response) carry the terminal status.
                    let (status, metadata) = call::parse_trailers(&fields);
                    call.on_trailers(status, metadata);
                } else if end_stream {
                    // Server side: the client finished sending.
                    call.on_data(&[], true);
                }
            } else {
                call.on_initial_metadata(call::headers_to_metadata(&fields));
            }
            return;
        }

        if let Some(sink) = &self.sink
            && !trailing
        {
            match call::parse_request_head(&fields) {
                Some(head) => sink.deliver(self, stream_id, head, end_stream),
                None => {
                    warn!(stream = %stream_id, "request without :path refused");
                    self.reset_stream(stream_id, ErrorCode::ProtocolError);
                }
            }
        }
    }

    fn lookup(&self, stream_id: StreamId) -> Option<Arc<CallShared>> {
        self.calls
            .lock()
            .get(&stream_id.value())
            .and_then(Weak::upgrade)
    }

    fn run_writer(self: &Arc<Self>) {
        loop {
            let work = {
                let mut queue = self.sendq.lock();
                loop {
                    if let Some(work) = queue.items.pop_front() {
                        break Some(work);
                    }
                    if queue.shutdown {
                        break None;
                    }
                    self.send_cv.wait(&mut queue);
                }
            };
            let Some(work) = work else { break };
            self.execute(work);
        }

        // Anything still queued after shutdown fails its batch.
        let leftovers: Vec<SendWork> = self.sendq.lock().items.drain(..).collect();
        for work in leftovers {
            if let Some(call) = work.call.upgrade() {
                call.on_send_done();
            }
            work.completion.op_done(false);
        }
    }

    fn execute(&self, work: SendWork) {
        let call = work.call.upgrade();
        let ok = self.try_execute(&work, call.as_deref());
        // Clear the in-flight marker before the event becomes visible,
        // so an application that reacts to the event can submit its
        // next send batch immediately.
        if let Some(call) = &call {
            call.on_send_done();
        }
        work.completion.op_done(ok);
    }

    fn try_execute(&self, work: &SendWork, call: Option<&CallShared>) -> bool {
        if self.is_broken() {
            return false;
        }
        if let Some(call) = call
            && call.is_cancelled()
        {
            return false;
        }

        if let Some(fields) = &work.headers {
            let end = work.end_stream && work.message.is_none() && work.trailers.is_none();
            if self
                .write_frames(|engine| engine.send_headers(work.stream_id, fields, end))
                .is_err()
            {
                return false;
            }
        }

        if let Some(message) = &work.message {
            let end = work.end_stream && work.trailers.is_none();
            if !self.send_message_blocking(work.stream_id, message, end, call) {
                return false;
            }
        } else if work.end_stream && work.headers.is_none() && work.trailers.is_none() {
            // Close-only batch: an empty DATA frame with END_STREAM.
            if self
                .write_frames(|engine| engine.send_data(work.stream_id, &[], true).map(|_| ()))
                .is_err()
            {
                return false;
            }
        }

        if let Some(fields) = &work.trailers {
            if self
                .write_frames(|engine| engine.send_headers(work.stream_id, fields, true))
                .is_err()
            {
                return false;
            }
            // The response is complete; the engine can forget the
            // stream.
            self.engine.lock().remove_stream(work.stream_id);
        }

        true
    }

    /// Queue a DATA payload, blocking on WINDOW_UPDATE whenever the
    /// windows cannot take more.
    fn send_message_blocking(
        &self,
        stream_id: StreamId,
        message: &Bytes,
        end_stream: bool,
        call: Option<&CallShared>,
    ) -> bool {
        let mut sent = 0;
        loop {
            if self.is_broken() {
                return false;
            }
            if let Some(call) = call
                && call.is_cancelled()
            {
                return false;
            }

            let queued = {
                let write_guard = self.write_lock.lock();
                let mut engine = self.engine.lock();
                match engine.send_data(stream_id, &message[sent..], end_stream) {
                    Ok(n) => {
                        let data = engine.take_write_buf();
                        drop(engine);
                        if !data.is_empty() && self.transport.write_all(&data).is_err() {
                            drop(write_guard);
                            self.fail_connection("transport write failed");
                            return false;
                        }
                        n
                    }
                    Err(err) => {
                        trace!(stream = %stream_id, %err, "send_data failed");
                        return false;
                    }
                }
            };

            sent += queued;
            if sent >= message.len() {
                return true;
            }

            // Flow-control block; woken by the reader after inbound
            // frames, re-checked on a short interval for teardown.
            let mut guard = self.window.lock();
            self.window_cv
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    /// Run `f` against the engine and push whatever it queued onto the
    /// transport, all under the write lock.
    fn write_frames<F>(&self, f: F) -> Result<(), ()>
    where
        F: FnOnce(&mut Engine) -> Result<(), ConnectionError>,
    {
        let _write_guard = self.write_lock.lock();
        let data = {
            let mut engine = self.engine.lock();
            if f(&mut engine).is_err() {
                return Err(());
            }
            engine.take_write_buf()
        };
        if !data.is_empty() && self.transport.write_all(&data).is_err() {
            self.fail_connection("transport write failed");
            return Err(());
        }
        Ok(())
    }

    fn flush_writes(&self) -> Result<(), ()> {
        self.write_frames(|_| Ok(()))
    }

    fn fail_connection(&self, reason: &str) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(reason, "connection torn down");

        self.engine.lock().close();
        self.transport.shutdown();

        self.sendq.lock().shutdown = true;
        self.send_cv.notify_all();
        self.window_cv.notify_all();

        {
            let mut flag = self.ready.lock();
            if matches!(*flag, ReadyFlag::Pending) {
                *flag = ReadyFlag::Failed;
            }
        }
        self.ready_cv.notify_all();

        let calls: Vec<Arc<CallShared>> = self
            .calls
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for call in calls {
            call.fail(Status::unavailable(reason));
        }
    }
}

impl Drop for ConnDriver {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}
