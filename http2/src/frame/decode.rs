//! Frame decoding.

use bytes::{Buf, Bytes, BytesMut};

use super::error::FrameError;
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, flags};

/// Incremental frame parser.
///
/// `decode` consumes at most one complete frame from the front of the
/// buffer per call; partial input is left untouched until more bytes
/// arrive.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Apply our advertised SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Try to decode one frame. Returns `Ok(None)` when the buffer does
    /// not yet hold a complete frame.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = peek_header(buf);

        if header.length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: header.length,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        let frame = match FrameType::from_u8(header.frame_type) {
            Some(FrameType::Data) => self.parse_data(header, payload)?,
            Some(FrameType::Headers) => self.parse_headers(header, payload)?,
            Some(FrameType::RstStream) => self.parse_rst_stream(header, payload)?,
            Some(FrameType::Settings) => self.parse_settings(header, payload)?,
            Some(FrameType::Ping) => self.parse_ping(header, payload)?,
            Some(FrameType::GoAway) => self.parse_goaway(header, payload)?,
            Some(FrameType::WindowUpdate) => self.parse_window_update(header, payload)?,
            Some(FrameType::Continuation) => self.parse_continuation(header, payload)?,
            None => Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload,
            }),
        };

        Ok(Some(frame))
    }

    fn parse_data(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if header.stream_id.is_connection() {
            return Err(FrameError::StreamRequired {
                frame_type: header.frame_type,
            });
        }

        let data = if header.has_flag(flags::PADDED) {
            strip_padding(payload)?
        } else {
            payload
        };

        Ok(Frame::Data(DataFrame {
            stream_id: header.stream_id,
            end_stream: header.has_flag(flags::END_STREAM),
            data,
        }))
    }

    fn parse_headers(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if header.stream_id.is_connection() {
            return Err(FrameError::StreamRequired {
                frame_type: header.frame_type,
            });
        }

        let mut block = if header.has_flag(flags::PADDED) {
            strip_padding(payload)?
        } else {
            payload
        };

        // Priority fields are parsed past but not modeled.
        if header.has_flag(flags::PRIORITY) {
            if block.len() < 5 {
                return Err(FrameError::BadLength {
                    frame_type: header.frame_type,
                    length: header.length,
                });
            }
            block.advance(5);
        }

        Ok(Frame::Headers(HeadersFrame {
            stream_id: header.stream_id,
            end_stream: header.has_flag(flags::END_STREAM),
            end_headers: header.has_flag(flags::END_HEADERS),
            header_block: block,
        }))
    }

    fn parse_rst_stream(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if header.stream_id.is_connection() {
            return Err(FrameError::StreamRequired {
                frame_type: header.frame_type,
            });
        }
        if payload.len() != 4 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }

        Ok(Frame::RstStream(RstStreamFrame {
            stream_id: header.stream_id,
            error_code: read_u32(&payload),
        }))
    }

    fn parse_settings(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if !header.stream_id.is_connection() {
            return Err(FrameError::ConnectionOnly {
                frame_type: header.frame_type,
            });
        }

        let ack = header.has_flag(flags::ACK);
        if ack && !payload.is_empty() {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }
        if payload.len() % 6 != 0 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }

        let settings = payload
            .chunks_exact(6)
            .map(|chunk| Setting {
                id: SettingId::from_u16(u16::from_be_bytes([chunk[0], chunk[1]])),
                value: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            })
            .collect();

        Ok(Frame::Settings(SettingsFrame { ack, settings }))
    }

    fn parse_ping(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if !header.stream_id.is_connection() {
            return Err(FrameError::ConnectionOnly {
                frame_type: header.frame_type,
            });
        }
        if payload.len() != 8 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }

        let mut data = [0u8; 8];
        data.copy_from_slice(&payload);
        Ok(Frame::Ping(PingFrame {
            ack: header.has_flag(flags::ACK),
            data,
        }))
    }

    fn parse_goaway(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        if !header.stream_id.is_connection() {
            return Err(FrameError::ConnectionOnly {
                frame_type: header.frame_type,
            });
        }
        if payload.len() < 8 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }

        let last_stream_id = StreamId::new(read_u32(&payload));
        let error_code = read_u32(&payload[4..]);
        payload.advance(8);

        Ok(Frame::GoAway(GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data: payload,
        }))
    }

    fn parse_window_update(
        &self,
        header: FrameHeader,
        payload: Bytes,
    ) -> Result<Frame, FrameError> {
        if payload.len() != 4 {
            return Err(FrameError::BadLength {
                frame_type: header.frame_type,
                length: header.length,
            });
        }

        // Reserved bit cleared on receipt.
        let increment = read_u32(&payload) & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(FrameError::BadWindowIncrement { increment });
        }

        Ok(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: header.stream_id,
            increment,
        }))
    }

    fn parse_continuation(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if header.stream_id.is_connection() {
            return Err(FrameError::StreamRequired {
                frame_type: header.frame_type,
            });
        }

        Ok(Frame::Continuation(ContinuationFrame {
            stream_id: header.stream_id,
            end_headers: header.has_flag(flags::END_HEADERS),
            header_block: payload,
        }))
    }
}

/// Read the fixed header without consuming it.
fn peek_header(buf: &[u8]) -> FrameHeader {
    debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
    FrameHeader {
        length: ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32),
        frame_type: buf[3],
        flags: buf[4],
        // Reserved bit on the stream id is ignored, not an error.
        stream_id: StreamId::new(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]])),
    }
}

#[inline]
fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Strip the pad-length octet and trailing padding from a payload.
fn strip_padding(mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::BadPadding {
            pad_length: 0,
            payload_length: 0,
        });
    }
    let pad_length = payload[0];
    payload.advance(1);
    if pad_length as usize > payload.len() {
        return Err(FrameError::BadPadding {
            pad_length,
            payload_length: payload.len(),
        });
    }
    payload.truncate(payload.len() - pad_length as usize);
    Ok(payload)
}
