//! Client channels.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http2::{Connection, ConnectionSettings, StreamId};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::call::Call;
use crate::completion::CompletionQueue;
use crate::driver::{ConnDriver, Engine};
use crate::runtime::Runtime;
use crate::transport::{ChannelCredentials, PlainTransport, TlsTransport, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum ChannelState {
    /// No connection attempted yet.
    Idle,
    Connected(Arc<ConnDriver>),
    /// A connection attempt failed or the connection died; every later
    /// call completes `UNAVAILABLE` until the channel is dropped.
    Broken,
}

struct ChannelShared {
    target: String,
    creds: Option<ChannelCredentials>,
    runtime: Runtime,
    state: Mutex<ChannelState>,
}

/// Client handle for one target. Creation performs no I/O; the
/// connection is established by the first call.
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn insecure(runtime: &Runtime, target: impl Into<String>) -> Self {
        Self::build(runtime, target.into(), None)
    }

    pub fn secure(
        runtime: &Runtime,
        target: impl Into<String>,
        creds: ChannelCredentials,
    ) -> Self {
        Self::build(runtime, target.into(), Some(creds))
    }

    fn build(runtime: &Runtime, target: String, creds: Option<ChannelCredentials>) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                target,
                creds,
                runtime: runtime.clone(),
                state: Mutex::new(ChannelState::Idle),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Create a call for `method` (`/service/Method`).
    ///
    /// The first call on a channel connects it. A call whose channel
    /// cannot reach the peer is still returned; its batches complete
    /// with `success: false` and status `UNAVAILABLE`.
    pub fn create_call(
        &self,
        cq: &CompletionQueue,
        method: &str,
        host: Option<&str>,
        deadline: Option<Instant>,
    ) -> Call {
        let wire = self.shared.ensure_connected();

        let (wire, stream_id) = match wire {
            Some(driver) => match driver.open_stream() {
                Ok(stream_id) => (Some(driver), stream_id),
                Err(err) => {
                    trace!(%err, "could not open stream");
                    (None, StreamId::new(0))
                }
            },
            None => (None, StreamId::new(0)),
        };

        let (call, shared) = Call::client(wire.clone(), stream_id, cq.clone(), method, host, deadline);

        if let Some(driver) = &wire {
            driver.register_call(stream_id, Arc::downgrade(&shared));
        }
        if let Some(at) = deadline {
            self.shared
                .runtime
                .schedule_deadline(at, Arc::downgrade(&shared));
        }

        call
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        if let ChannelState::Connected(driver) = &*self.state.lock() {
            driver.shutdown();
        }
    }
}

impl ChannelShared {
    fn ensure_connected(&self) -> Option<Arc<ConnDriver>> {
        let mut state = self.state.lock();
        match &*state {
            ChannelState::Connected(driver) if !driver.is_broken() => Some(driver.clone()),
            ChannelState::Connected(_) => {
                debug!(target = %self.target, "connection lost; channel broken");
                *state = ChannelState::Broken;
                None
            }
            ChannelState::Broken => None,
            ChannelState::Idle => match self.connect() {
                Ok(driver) => {
                    *state = ChannelState::Connected(driver.clone());
                    Some(driver)
                }
                Err(err) => {
                    debug!(target = %self.target, error = %err, "connect failed; channel broken");
                    *state = ChannelState::Broken;
                    None
                }
            },
        }
    }

    fn connect(&self) -> io::Result<Arc<ConnDriver>> {
        let host = self
            .target
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.target.as_str());

        let addr = self
            .target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "target resolved to no address")
            })?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;

        let transport: Arc<dyn Transport> = match &self.creds {
            None => Arc::new(PlainTransport::new(stream)?),
            Some(creds) => {
                let config = creds.client_config()?;
                Arc::new(TlsTransport::connect(config, host, stream)?)
            }
        };

        let engine = Engine::Client(Connection::new(ConnectionSettings::default()));
        let driver = ConnDriver::new(
            transport,
            engine,
            self.target.clone(),
            self.creds.is_some(),
            None,
        );
        driver.start();

        if !driver.wait_ready(HANDSHAKE_TIMEOUT) {
            driver.shutdown();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "HTTP/2 handshake did not complete",
            ));
        }

        debug!(target = %self.target, "channel connected");
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Batch;
    use crate::completion::{CompletionType, EventKind};
    use crate::status::Code;

    #[test]
    fn creation_does_no_io() {
        let runtime = Runtime::new();
        let channel = Channel::insecure(&runtime, "localhost:1");
        assert_eq!(channel.target(), "localhost:1");
        assert!(matches!(
            &*channel.shared.state.lock(),
            ChannelState::Idle
        ));
    }

    #[test]
    fn unreachable_target_breaks_channel() {
        let runtime = Runtime::new();
        // Port 1 on localhost is almost certainly closed; connect fails
        // fast with ECONNREFUSED.
        let channel = Channel::insecure(&runtime, "127.0.0.1:1");
        let cq = CompletionQueue::new(CompletionType::Next);

        let call = channel.create_call(&cq, "/echo.Echo/Say", None, None);
        assert!(matches!(
            &*channel.shared.state.lock(),
            ChannelState::Broken
        ));

        let mut batch = Batch::new();
        batch.send_initial_metadata(crate::metadata::Metadata::new());
        let status_slot = batch.recv_status_on_client();
        call.start_batch(batch, 77).unwrap();

        let event = cq.next(Instant::now() + Duration::from_secs(2));
        assert_eq!(event.tag, 77);
        assert_eq!(event.kind, EventKind::OpComplete);
        assert!(!event.success);
        assert_eq!(status_slot.take().unwrap().0.code(), Code::Unavailable);
    }

    #[test]
    fn broken_channel_stays_broken() {
        let runtime = Runtime::new();
        let channel = Channel::insecure(&runtime, "127.0.0.1:1");
        let cq = CompletionQueue::new(CompletionType::Next);

        let _ = channel.create_call(&cq, "/a/B", None, None);
        let _ = channel.create_call(&cq, "/a/C", None, None);
        assert!(matches!(
            &*channel.shared.state.lock(),
            ChannelState::Broken
        ));
    }
}
