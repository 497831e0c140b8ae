//! Server-side connection engine.

use bytes::{Bytes, BytesMut};

use super::flow::FlowControl;
use super::settings::ConnectionSettings;
use super::streams::StreamMap;
use super::{ConnEvent, ConnectionError, ConnectionState, apply_remote_settings};
use crate::frame::{
    self, CONNECTION_PREFACE, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder, GoAwayFrame,
    HeadersFrame, PingFrame, RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId,
    WindowUpdateFrame,
};
use crate::hpack::{self, HeaderField};

/// Accepts client-initiated streams and produces responses.
///
/// Construction queues our SETTINGS (the server half of the connection
/// preface). `recv()` first verifies the 24-octet client magic, then
/// dispatches frames. A client stream surfaces as a
/// [`ConnEvent::Headers`] with `trailing: false` on an id not seen
/// before.
pub struct ServerConnection {
    state: ConnectionState,
    local_settings: ConnectionSettings,
    remote_settings: ConnectionSettings,
    got_preface: bool,
    got_settings: bool,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    streams: StreamMap,
    flow: FlowControl,
    read_buf: BytesMut,
    write_buf: BytesMut,
    events: Vec<ConnEvent>,
}

impl ServerConnection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(settings.max_frame_size);

        let mut conn = Self {
            state: ConnectionState::Handshaking,
            local_settings: settings,
            remote_settings: ConnectionSettings::default(),
            got_preface: false,
            got_settings: false,
            decoder,
            encoder: FrameEncoder::new(),
            streams: StreamMap::new(2),
            flow: FlowControl::new(
                frame::DEFAULT_INITIAL_WINDOW_SIZE,
                frame::DEFAULT_INITIAL_WINDOW_SIZE,
            ),
            read_buf: BytesMut::with_capacity(16384),
            write_buf: BytesMut::with_capacity(16384),
            events: Vec::new(),
        };

        conn.queue_local_settings();
        conn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn recv(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.read_buf.extend_from_slice(data);

        if !self.got_preface {
            if self.read_buf.len() < CONNECTION_PREFACE.len() {
                return Ok(());
            }
            if &self.read_buf[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                return Err(ConnectionError::Protocol(
                    "invalid client connection preface".into(),
                ));
            }
            let _ = self.read_buf.split_to(CONNECTION_PREFACE.len());
            self.got_preface = true;
        }

        self.process()
    }

    pub fn take_write_buf(&mut self) -> Bytes {
        self.write_buf.split().freeze()
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn poll_events(&mut self) -> Vec<ConnEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Announce shutdown to the client; streams at or below
    /// `last_stream_id` will still be served.
    pub fn send_goaway(&mut self, last_stream_id: StreamId, error: ErrorCode) {
        let frame = Frame::GoAway(GoAwayFrame {
            last_stream_id,
            error_code: error.to_u32(),
            debug_data: Bytes::new(),
        });
        self.encoder.encode(&frame, &mut self.write_buf);
        self.state = ConnectionState::Draining;
    }

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

    /// Flow-controlled DATA send; same contract as the client engine.
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

    pub fn reset_stream(&mut self, stream_id: StreamId, error: ErrorCode) {
        if self.streams.remove(stream_id).is_some() {
            let frame = Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code: error.to_u32(),
            });
            self.encoder.encode(&frame, &mut self.write_buf);
        }
    }

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
        Ok(())
    }

    fn handle_headers(&mut self, frame: HeadersFrame) -> Result<(), ConnectionError> {
        let fields = hpack::decode_block(&frame.header_block)?;

        if !self.streams.contains(frame.stream_id) {
            // A new client stream. Past the concurrency cap it is
            // refused rather than torn down with the connection.
            if self.state == ConnectionState::Draining
                || self.streams.len() >= self.local_settings.max_concurrent_streams as usize
            {
                let rst = Frame::RstStream(RstStreamFrame {
                    stream_id: frame.stream_id,
                    error_code: ErrorCode::RefusedStream.to_u32(),
                });
                self.encoder.encode(&rst, &mut self.write_buf);
                return Ok(());
            }

            let send_window = self.remote_settings.initial_window_size;
            let recv_window = self.local_settings.initial_window_size;
            if self
                .streams
                .accept_remote(frame.stream_id, send_window, recv_window)
                .is_none()
            {
                return Err(ConnectionError::Protocol(format!(
                    "invalid client stream id {}",
                    frame.stream_id
                )));
            }
        }

        let Some(stream) = self.streams.get_mut(frame.stream_id) else {
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
        self.events.push(ConnEvent::GoAway {
            last_stream_id: frame.last_stream_id,
            error: ErrorCode::from_u32(frame.error_code),
        });
        Ok(())
    }
}
