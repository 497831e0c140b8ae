//! Connection engines.
//!
//! [`Connection`] (client) and [`ServerConnection`] are sans-io state
//! machines. The driver feeds received bytes into `recv()`, drains the
//! bytes the engine wants on the wire with `take_write_buf()`, and
//! consumes protocol activity from `poll_events()`. A fatal error
//! returned from `recv()` means the connection must be torn down; every
//! stream on it is dead.

mod flow;
mod server;
mod settings;
mod stream;
mod streams;

pub use flow::{FlowControl, FlowError, MAX_WINDOW};
pub use server::ServerConnection;
pub use settings::ConnectionSettings;
pub use stream::{Stream, StreamState};
pub use streams::StreamMap;

use bytes::{Bytes, BytesMut};

use crate::frame::{
    self, CONNECTION_PREFACE, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder, FrameError,
    GoAwayFrame, HeadersFrame, PingFrame, RstStreamFrame, Setting, SettingId, SettingsFrame,
    StreamId, WindowUpdateFrame,
};
use crate::hpack::{self, HeaderField, HpackError};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Preface/SETTINGS exchange still in progress.
    Handshaking,
    /// Streams may be opened and frames exchanged.
    Open,
    /// GOAWAY seen; existing streams may finish, no new ones.
    Draining,
    Closed,
}

/// Activity surfaced to the driver.
#[derive(Debug)]
pub enum ConnEvent {
    /// SETTINGS exchange finished; streams may be opened.
    Ready,
    /// A header block arrived.
    Headers {
        stream_id: StreamId,
        fields: Vec<HeaderField>,
        /// True for the second block on a stream (trailers).
        trailing: bool,
        end_stream: bool,
    },
    /// Stream payload arrived.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Peer reset the stream.
    StreamReset {
        stream_id: StreamId,
        error: ErrorCode,
    },
    /// Peer is shutting the connection down.
    GoAway {
        last_stream_id: StreamId,
        error: ErrorCode,
    },
}

/// Fatal connection errors.
#[derive(Debug)]
pub enum ConnectionError {
    Frame(FrameError),
    Hpack(HpackError),
    Flow(FlowError),
    Protocol(String),
    /// Operation requires the connection to be open.
    NotReady,
    /// Peer's concurrent stream limit reached.
    StreamLimit,
    /// The addressed stream does not exist.
    UnknownStream(StreamId),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Frame(e) => write!(f, "frame error: {}", e),
            ConnectionError::Hpack(e) => write!(f, "header coding error: {}", e),
            ConnectionError::Flow(e) => write!(f, "flow control error: {}", e),
            ConnectionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectionError::NotReady => write!(f, "connection not ready"),
            ConnectionError::StreamLimit => write!(f, "concurrent stream limit reached"),
            ConnectionError::UnknownStream(id) => write!(f, "unknown stream {}", id),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}

impl From<HpackError> for ConnectionError {
    fn from(e: HpackError) -> Self {
        ConnectionError::Hpack(e)
    }
}

impl From<FlowError> for ConnectionError {
    fn from(e: FlowError) -> Self {
        ConnectionError::Flow(e)
    }
}

/// Client-side HTTP/2 connection engine.
///
/// Construction queues the 24-octet preface and our SETTINGS; the
/// connection becomes [`ConnectionState::Open`] once the server's
/// SETTINGS arrive and are acknowledged.
pub struct Connection {
    state: ConnectionState,
    local_settings: ConnectionSettings,
    remote_settings: ConnectionSettings,
    got_settings: bool,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    streams: StreamMap,
    /// Connection-scope flow control.
    flow: FlowControl,
    read_buf: BytesMut,
    write_buf: BytesMut,
    events: Vec<ConnEvent>,
}

impl Connection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(settings.max_frame_size);

        let mut conn = Self {
            state: ConnectionState::Handshaking,
            local_settings: settings,
            remote_settings: ConnectionSettings::default(),
            got_settings: false,
            decoder,
            encoder: FrameEncoder::new(),
            streams: StreamMap::new(1),
            flow: FlowControl::new(
                frame::DEFAULT_INITIAL_WINDOW_SIZE,
                frame::DEFAULT_INITIAL_WINDOW_SIZE,
            ),
            read_buf: BytesMut::with_capacity(16384),
            write_buf: BytesMut::with_capacity(16384),
            events: Vec::new(),
        };

        conn.write_buf.extend_from_slice(CONNECTION_PREFACE);
        conn.queue_local_settings();
        conn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn remote_settings(&self) -> &ConnectionSettings {
        &self.remote_settings
    }

    /// Feed bytes read from the transport.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.read_buf.extend_from_slice(data);
        self.process()
    }

    /// Take queued outgoing bytes for the transport.
    pub fn take_write_buf(&mut self) -> Bytes {
        self.write_buf.split().freeze()
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Drain accumulated events.
    pub fn poll_events(&mut self) -> Vec<ConnEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Allocate a new client-initiated stream. No frames are emitted;
    /// the caller sends HEADERS when it is ready.
    pub fn open_stream(&mut self) -> Result<StreamId, ConnectionError> {
        if self.state != ConnectionState::Open {
            return Err(ConnectionError::NotReady);
        }
        if self.streams.len() >= self.remote_settings.max_concurrent_streams as usize {
            return Err(ConnectionError::StreamLimit);
        }
        Ok(self.streams.allocate(
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
        ))
    }

    /// Encode and queue a HEADERS frame carrying `fields`.
    pub fn send_headers(
        &mut self,
        stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(ConnectionError::UnknownStream(stream_id))?;
        if end_stream {
            stream.send_end_stream();
        }

        let mut block = Vec::new();
        hpack::encode_block(fields, &mut block);

        let frame = Frame::Headers(HeadersFrame {
            stream_id,
            end_stream,
            end_headers: true,
            header_block: Bytes::from(block),
        });
        self.encoder.encode(&frame, &mut self.write_buf);
        Ok(())
    }

    /// Queue as much of `data` as the flow windows and frame size allow.
    ///
    /// Returns the number of payload bytes queued; when it is less than
    /// `data.len()` the caller must wait for a WINDOW_UPDATE and retry
    /// with the remainder. `end_stream` is attached to the frame that
    /// carries the final byte (or to an empty frame when `data` is
    /// empty).
    pub fn send_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize, ConnectionError> {
        if !self.streams.contains(stream_id) {
            return Err(ConnectionError::UnknownStream(stream_id));
        }

        if data.is_empty() {
            if end_stream {
                self.queue_data_frame(stream_id, &[], true);
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.send_end_stream();
                }
            }
            return Ok(0);
        }

        let max_frame = self.encoder.max_frame_size() as usize;
        let mut sent = 0;

        while sent < data.len() {
            let stream_avail = match self.streams.get_mut(stream_id) {
                Some(stream) => stream.flow().send_available(),
                None => break,
            };
            let avail = self
                .flow
                .send_available()
                .min(stream_avail)
                .min(max_frame);
            if avail == 0 {
                break;
            }

            let chunk = avail.min(data.len() - sent);
            let last = end_stream && sent + chunk == data.len();
            self.queue_data_frame(stream_id, &data[sent..sent + chunk], last);

            self.flow.consume_send(chunk);
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.flow_mut().consume_send(chunk);
                if last {
                    stream.send_end_stream();
                }
            }
            sent += chunk;
        }

        Ok(sent)
    }

    /// Reset a stream and forget it.
    pub fn reset_stream(&mut self, stream_id: StreamId, error: ErrorCode) {
        if self.streams.remove(stream_id).is_some() {
            let frame = Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code: error.to_u32(),
            });
            self.encoder.encode(&frame, &mut self.write_buf);
        }
    }

    /// Forget a stream without emitting RST_STREAM (normal completion).
    pub fn remove_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(stream_id);
    }

    fn queue_local_settings(&mut self) {
        let frame = Frame::Settings(SettingsFrame {
            ack: false,
            settings: vec![
                Setting {
                    id: SettingId::MaxConcurrentStreams,
                    value: self.local_settings.max_concurrent_streams,
                },
                Setting {
                    id: SettingId::InitialWindowSize,
                    value: self.local_settings.initial_window_size,
                },
                Setting {
                    id: SettingId::MaxFrameSize,
                    value: self.local_settings.max_frame_size,
                },
            ],
        });
        self.encoder.encode(&frame, &mut self.write_buf);
    }

    fn queue_data_frame(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let frame = Frame::Data(DataFrame {
            stream_id,
            end_stream,
            data: Bytes::copy_from_slice(data),
        });
        self.encoder.encode(&frame, &mut self.write_buf);
    }

    fn process(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&mut self.read_buf)? {
                Some(frame) => self.handle_frame(frame)?,
                None => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::Settings(f) => self.handle_settings(f),
            Frame::Ping(f) => self.handle_ping(f),
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::Headers(f) => self.handle_headers(f),
            Frame::Data(f) => self.handle_data(f),
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::GoAway(f) => self.handle_goaway(f),
            Frame::Continuation(_) => Err(ConnectionError::Protocol(
                "unexpected CONTINUATION frame".into(),
            )),
            // Unknown frame types (including PRIORITY and PUSH_PROMISE)
            // are ignored.
            Frame::Unknown(_) => Ok(()),
        }
    }

    fn handle_settings(&mut self, frame: SettingsFrame) -> Result<(), ConnectionError> {
        if frame.ack {
            return Ok(());
        }

        apply_remote_settings(
            &frame.settings,
            &mut self.remote_settings,
            &mut self.encoder,
            &mut self.streams,
        )?;

        let ack = Frame::Settings(SettingsFrame {
            ack: true,
            settings: Vec::new(),
        });
        self.encoder.encode(&ack, &mut self.write_buf);

        if !self.got_settings {
            self.got_settings = true;
            self.state = ConnectionState::Open;
            self.events.push(ConnEvent::Ready);
        }
        Ok(())
    }

    fn handle_ping(&mut self, frame: PingFrame) -> Result<(), ConnectionError> {
        if !frame.ack {
            let ack = Frame::Ping(PingFrame {
                ack: true,
                data: frame.data,
            });
            self.encoder.encode(&ack, &mut self.write_buf);
        }
        Ok(())
    }

    fn handle_window_update(&mut self, frame: WindowUpdateFrame) -> Result<(), ConnectionError> {
        if frame.stream_id.is_connection() {
            self.flow.window_update(frame.increment)?;
        } else if let Some(stream) = self.streams.get_mut(frame.stream_id) {
            stream.flow_mut().window_update(frame.increment)?;
        }
        // Updates for departed streams are ignored.
        Ok(())
    }

    fn handle_headers(&mut self, frame: HeadersFrame) -> Result<(), ConnectionError> {
        let fields = hpack::decode_block(&frame.header_block)?;

        let Some(stream) = self.streams.get_mut(frame.stream_id) else {
            // Stream already reset locally; drop the block.
            return Ok(());
        };

        let trailing = stream.mark_headers();
        if frame.end_stream {
            stream.recv_end_stream();
        }

        self.events.push(ConnEvent::Headers {
            stream_id: frame.stream_id,
            fields,
            trailing,
            end_stream: frame.end_stream,
        });
        Ok(())
    }

    fn handle_data(&mut self, frame: DataFrame) -> Result<(), ConnectionError> {
        let len = frame.data.len();

        // Connection-scope accounting covers every DATA frame, stream
        // known or not.
        if let Some(increment) = self.flow.consume_recv(len)? {
            let wu = Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                increment,
            });
            self.encoder.encode(&wu, &mut self.write_buf);
        }

        let Some(stream) = self.streams.get_mut(frame.stream_id) else {
            return Ok(());
        };

        if let Some(increment) = stream.flow_mut().consume_recv(len)? {
            let wu = Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: frame.stream_id,
                increment,
            });
            self.encoder.encode(&wu, &mut self.write_buf);
        }
        if frame.end_stream {
            stream.recv_end_stream();
        }

        self.events.push(ConnEvent::Data {
            stream_id: frame.stream_id,
            data: frame.data,
            end_stream: frame.end_stream,
        });
        Ok(())
    }

    fn handle_rst_stream(&mut self, frame: RstStreamFrame) -> Result<(), ConnectionError> {
        if self.streams.remove(frame.stream_id).is_some() {
            self.events.push(ConnEvent::StreamReset {
                stream_id: frame.stream_id,
                error: ErrorCode::from_u32(frame.error_code),
            });
        }
        Ok(())
    }

    fn handle_goaway(&mut self, frame: GoAwayFrame) -> Result<(), ConnectionError> {
        self.state = ConnectionState::Draining;

        // Streams the peer will never process are failed right away.
        for stream_id in self.streams.drain_above(frame.last_stream_id, 1) {
            self.events.push(ConnEvent::StreamReset {
                stream_id,
                error: ErrorCode::RefusedStream,
            });
        }
        self.events.push(ConnEvent::GoAway {
            last_stream_id: frame.last_stream_id,
            error: ErrorCode::from_u32(frame.error_code),
        });
        Ok(())
    }
}

/// Apply a peer SETTINGS frame: shared between client and server
/// engines.
fn apply_remote_settings(
    settings: &[Setting],
    remote: &mut ConnectionSettings,
    encoder: &mut FrameEncoder,
    streams: &mut StreamMap,
) -> Result<(), ConnectionError> {
    for setting in settings {
        match setting.id {
            SettingId::MaxConcurrentStreams => {
                remote.max_concurrent_streams = setting.value;
            }
            SettingId::InitialWindowSize => {
                if setting.value as i64 > MAX_WINDOW {
                    return Err(ConnectionError::Flow(FlowError::WindowOverflow));
                }
                let delta = setting.value as i64 - remote.initial_window_size as i64;
                remote.initial_window_size = setting.value;
                // Outstanding streams shift by the delta; this is the
                // only retroactive setting.
                streams.adjust_send_windows(delta);
            }
            SettingId::MaxFrameSize => {
                if setting.value < frame::DEFAULT_MAX_FRAME_SIZE
                    || setting.value > frame::MAX_ALLOWED_FRAME_SIZE
                {
                    return Err(ConnectionError::Protocol(format!(
                        "invalid SETTINGS_MAX_FRAME_SIZE {}",
                        setting.value
                    )));
                }
                remote.max_frame_size = setting.value;
                encoder.set_max_frame_size(setting.value);
            }
            SettingId::EnablePush => {
                if setting.value > 1 {
                    return Err(ConnectionError::Protocol(format!(
                        "invalid SETTINGS_ENABLE_PUSH {}",
                        setting.value
                    )));
                }
            }
            SettingId::MaxHeaderListSize => {
                remote.max_header_list_size = setting.value;
            }
            // No dynamic table is kept, so the peer's header table size
            // is irrelevant; RFC 7540 requires ignoring unknown ids.
            SettingId::HeaderTableSize | SettingId::Unknown(_) => {}
        }
    }
    Ok(())
}
