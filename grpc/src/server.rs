//! The server: listeners, worker pool, and incoming-call plumbing.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use http2::{ConnectionSettings, ErrorCode, ServerConnection, StreamId};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tracing::{debug, trace, warn};

use crate::call::{Call, CallShared, OutputSlot, RequestHead};
use crate::completion::{CompletionQueue, Event, Tag};
use crate::driver::{ConnDriver, Engine, RequestSink};
use crate::error::CallError;
use crate::runtime::Runtime;
use crate::transport::{PlainTransport, ServerCredentials, TlsTransport, Transport};

const DEFAULT_WORKER_THREADS: usize = 4;
const LISTEN_BACKLOG: i32 = 128;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request attributes surfaced alongside a new server call.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub method: String,
    pub host: Option<String>,
    pub deadline: Option<Instant>,
}

/// Handle returned by [`Server::request_call`]. Once the registered tag
/// completes on its queue, [`take`](RequestedCall::take) yields the
/// materialized call.
pub struct RequestedCall {
    slot: OutputSlot<(Call, CallDetails)>,
}

impl RequestedCall {
    pub fn take(&self) -> Option<(Call, CallDetails)> {
        self.slot.take()
    }
}

struct BoundPort {
    listener: TcpListener,
    creds: Option<ServerCredentials>,
    port: u16,
}

struct ServerState {
    ports: Vec<Arc<BoundPort>>,
    cqs: Vec<CompletionQueue>,
    started: bool,
}

struct Waiter {
    cq: CompletionQueue,
    tag: Tag,
    slot: OutputSlot<(Call, CallDetails)>,
}

#[derive(Default)]
struct WaiterState {
    waiters: VecDeque<Waiter>,
    /// Calls that arrived before anyone asked for them.
    backlog: VecDeque<(Call, Arc<CallShared>, CallDetails)>,
}

struct ServerShared {
    runtime: Runtime,
    state: Mutex<ServerState>,
    waiters: Mutex<WaiterState>,
    shutdown: AtomicBool,
    drivers: Mutex<Vec<Weak<ConnDriver>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A gRPC server. Bind ports, register completion queues, start the
/// worker pool, then consume incoming calls via
/// [`request_call`](Server::request_call).
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                runtime: runtime.clone(),
                state: Mutex::new(ServerState {
                    ports: Vec::new(),
                    cqs: Vec::new(),
                    started: false,
                }),
                waiters: Mutex::new(WaiterState::default()),
                shutdown: AtomicBool::new(false),
                drivers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind a cleartext listener. Returns the bound port, or 0 on
    /// failure (including after `start`).
    pub fn add_insecure_http2_port(&self, addr: &str) -> u16 {
        self.add_port(addr, None)
    }

    /// Bind a TLS listener with the given server credentials.
    pub fn add_secure_http2_port(&self, addr: &str, creds: ServerCredentials) -> u16 {
        self.add_port(addr, Some(creds))
    }

    fn add_port(&self, addr: &str, creds: Option<ServerCredentials>) -> u16 {
        let mut state = self.shared.state.lock();
        if state.started {
            return 0;
        }
        match bind_listener(addr) {
            Ok((listener, port)) => {
                state.ports.push(Arc::new(BoundPort {
                    listener,
                    creds,
                    port,
                }));
                port
            }
            Err(err) => {
                debug!(addr, error = %err, "failed to bind port");
                0
            }
        }
    }

    /// Associate a completion queue with this server. Required before
    /// `start`; new-call and shutdown notifications go to queues passed
    /// to `request_call` / `shutdown_and_notify`.
    pub fn register_completion_queue(&self, cq: &CompletionQueue) {
        let mut state = self.shared.state.lock();
        if !state.started {
            state.cqs.push(cq.clone());
        }
    }

    /// Spawn the worker pool and begin accepting connections.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.started {
            return;
        }
        state.started = true;
        let ports = state.ports.clone();
        drop(state);

        let mut workers = self.shared.workers.lock();
        for index in 0..DEFAULT_WORKER_THREADS {
            let shared = self.shared.clone();
            let ports = ports.clone();
            let handle = std::thread::Builder::new()
                .name(format!("grpc-server-worker-{}", index))
                .spawn(move || worker_loop(shared, ports))
                .expect("spawn server worker");
            workers.push(handle);
        }
    }

    /// Register interest in the next incoming call. When a client
    /// opens a stream, the call is materialized, `{tag, success:true}`
    /// is pushed onto `cq`, and the handle's slot is filled.
    pub fn request_call(&self, cq: &CompletionQueue, tag: Tag) -> Result<RequestedCall, CallError> {
        {
            let state = self.shared.state.lock();
            if !state.started {
                return Err(CallError::NotInvoked);
            }
            // New-call events may only land on queues the server was
            // told about.
            if !state.cqs.iter().any(|registered| registered.same_queue(cq)) {
                return Err(CallError::Error);
            }
        }
        cq.register_pluck_tag(tag);

        let mut waiters = self.shared.waiters.lock();
        if let Some((call, shared, details)) = waiters.backlog.pop_front() {
            shared.bind_cq(cq.clone());
            let slot = OutputSlot::new();
            slot.put((call, details));
            drop(waiters);
            cq.push(Event::completion(tag, true));
            return Ok(RequestedCall { slot });
        }

        let slot = OutputSlot::new();
        waiters.waiters.push_back(Waiter {
            cq: cq.clone(),
            tag,
            slot: slot.clone(),
        });
        Ok(RequestedCall { slot })
    }

    /// Begin shutdown: stop accepting, tear down connections, and push
    /// `{tag, success:true}` onto `cq` once every worker has exited.
    pub fn shutdown_and_notify(&self, cq: &CompletionQueue, tag: Tag) {
        cq.register_pluck_tag(tag);
        self.shared.shutdown.store(true, Ordering::SeqCst);

        // Release our listener references; sockets close when the last
        // worker drops its clone.
        self.shared.state.lock().ports.clear();

        let drivers: Vec<Arc<ConnDriver>> = self
            .shared
            .drivers
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for driver in drivers {
            driver.shutdown();
        }

        let handles: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        let cq = cq.clone();
        std::thread::Builder::new()
            .name("grpc-server-shutdown".into())
            .spawn(move || {
                for handle in handles {
                    if handle.join().is_err() {
                        warn!("server worker panicked during shutdown");
                    }
                }
                cq.push(Event::completion(tag, true));
            })
            .expect("spawn shutdown notifier");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for driver in self.shared.drivers.lock().drain(..) {
            if let Some(driver) = driver.upgrade() {
                driver.shutdown();
            }
        }
        // Workers notice the flag within one poll interval and exit on
        // their own; they hold their own Arc of the shared state.
    }
}

impl RequestSink for ServerShared {
    fn deliver(
        &self,
        driver: &Arc<ConnDriver>,
        stream_id: StreamId,
        head: RequestHead,
        end_stream: bool,
    ) {
        if self.shutdown.load(Ordering::SeqCst) {
            driver.reset_stream(stream_id, ErrorCode::RefusedStream);
            return;
        }

        trace!(stream = %stream_id, method = %head.method, "incoming call");

        let details = CallDetails {
            method: head.method.clone(),
            host: head.host.clone(),
            deadline: head.deadline,
        };
        let (call, shared) = Call::server(
            driver.clone(),
            stream_id,
            head.method,
            head.host,
            head.deadline,
            head.metadata,
            end_stream,
        );
        driver.register_call(stream_id, Arc::downgrade(&shared));
        if let Some(at) = head.deadline {
            self.runtime.schedule_deadline(at, Arc::downgrade(&shared));
        }

        let mut waiters = self.waiters.lock();
        match waiters.waiters.pop_front() {
            Some(waiter) => {
                shared.bind_cq(waiter.cq.clone());
                waiter.slot.put((call, details));
                drop(waiters);
                waiter.cq.push(Event::completion(waiter.tag, true));
            }
            None => {
                waiters.backlog.push_back((call, shared, details));
            }
        }
    }
}

/// Accept loop run by each worker. A worker serves one connection at a
/// time: accept, handshake, then drive the frame-dispatch loop until
/// the connection ends.
fn worker_loop(shared: Arc<ServerShared>, ports: Vec<Arc<BoundPort>>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        let mut accepted = false;
        for port in &ports {
            match port.listener.accept() {
                Ok((stream, peer)) => {
                    accepted = true;
                    trace!(%peer, port = port.port, "accepted connection");
                    serve_connection(&shared, stream, port.creds.clone());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!(error = %err, "accept failed");
                }
            }
        }
        if !accepted {
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }
}

fn serve_connection(shared: &Arc<ServerShared>, stream: TcpStream, creds: Option<ServerCredentials>) {
    // The listener is non-blocking for the poll loop; the connection
    // itself must block.
    if stream.set_nonblocking(false).is_err() || stream.set_nodelay(true).is_err() {
        return;
    }

    let tls = creds.is_some();
    let transport: Arc<dyn Transport> = match creds {
        None => match PlainTransport::new(stream) {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                debug!(error = %err, "failed to set up transport");
                return;
            }
        },
        Some(creds) => {
            let config = match creds.server_config() {
                Ok(config) => config,
                Err(err) => {
                    debug!(error = %err, "invalid server credentials");
                    return;
                }
            };
            match TlsTransport::accept(config, stream) {
                Ok(transport) => Arc::new(transport),
                Err(err) => {
                    debug!(error = %err, "TLS handshake failed");
                    return;
                }
            }
        }
    };

    let engine = Engine::Server(ServerConnection::new(ConnectionSettings::default()));
    let sink: Arc<dyn RequestSink> = shared.clone();
    let driver = ConnDriver::new(transport, engine, String::new(), tls, Some(sink));

    shared.drivers.lock().push(Arc::downgrade(&driver));
    driver.spawn_writer();
    driver.run_reader();
}

/// Bind with `SO_REUSEADDR` and the fixed backlog; the listener is
/// non-blocking so workers can poll several ports and the shutdown
/// flag.
fn bind_listener(addr: &str) -> io::Result<(TcpListener, u16)> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable bind address"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
