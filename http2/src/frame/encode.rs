//! Frame encoding.

use bytes::{BufMut, BytesMut};

use super::types::*;
use super::{FRAME_HEADER_SIZE, flags};

/// Serializes frames into a byte buffer.
///
/// The encoder never splits payloads itself; callers are expected to
/// size DATA payloads at or below [`max_frame_size`](Self::max_frame_size).
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Apply the peer's SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Append one frame to `buf`.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.encode_data(f, buf),
            Frame::Headers(f) => self.encode_headers(f, buf),
            Frame::RstStream(f) => self.encode_rst_stream(f, buf),
            Frame::Settings(f) => self.encode_settings(f, buf),
            Frame::Ping(f) => self.encode_ping(f, buf),
            Frame::GoAway(f) => self.encode_goaway(f, buf),
            Frame::WindowUpdate(f) => self.encode_window_update(f, buf),
            Frame::Continuation(f) => self.encode_continuation(f, buf),
            Frame::Unknown(f) => self.encode_unknown(f, buf),
        }
    }

    #[inline]
    fn write_header(
        &self,
        buf: &mut BytesMut,
        length: u32,
        frame_type: u8,
        frame_flags: u8,
        stream_id: StreamId,
    ) {
        // 24-bit length, big-endian.
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame_type);
        buf.put_u8(frame_flags);
        // 31-bit stream id; reserved bit always zero on send.
        buf.put_u32(stream_id.value() & 0x7FFF_FFFF);
    }

    fn encode_data(&self, frame: &DataFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        let length = frame.data.len() as u32;
        debug_assert!(length <= self.max_frame_size);

        buf.reserve(FRAME_HEADER_SIZE + frame.data.len());
        self.write_header(
            buf,
            length,
            FrameType::Data as u8,
            frame_flags,
            frame.stream_id,
        );
        buf.extend_from_slice(&frame.data);
    }

    fn encode_headers(&self, frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        let length = frame.header_block.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + frame.header_block.len());
        self.write_header(
            buf,
            length,
            FrameType::Headers as u8,
            frame_flags,
            frame.stream_id,
        );
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_rst_stream(&self, frame: &RstStreamFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);
        self.write_header(buf, 4, FrameType::RstStream as u8, 0, frame.stream_id);
        buf.put_u32(frame.error_code);
    }

    fn encode_settings(&self, frame: &SettingsFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        let length = (frame.settings.len() * 6) as u32;
        debug_assert!(!frame.ack || frame.settings.is_empty());

        buf.reserve(FRAME_HEADER_SIZE + length as usize);
        self.write_header(
            buf,
            length,
            FrameType::Settings as u8,
            frame_flags,
            StreamId::CONNECTION,
        );
        for setting in &frame.settings {
            buf.put_u16(setting.id.to_u16());
            buf.put_u32(setting.value);
        }
    }

    fn encode_ping(&self, frame: &PingFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        buf.reserve(FRAME_HEADER_SIZE + 8);
        self.write_header(buf, 8, FrameType::Ping as u8, frame_flags, StreamId::CONNECTION);
        buf.extend_from_slice(&frame.data);
    }

    fn encode_goaway(&self, frame: &GoAwayFrame, buf: &mut BytesMut) {
        let length = (8 + frame.debug_data.len()) as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);
        self.write_header(buf, length, FrameType::GoAway as u8, 0, StreamId::CONNECTION);
        buf.put_u32(frame.last_stream_id.value() & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code);
        buf.extend_from_slice(&frame.debug_data);
    }

    fn encode_window_update(&self, frame: &WindowUpdateFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);
        self.write_header(buf, 4, FrameType::WindowUpdate as u8, 0, frame.stream_id);
        buf.put_u32(frame.increment & 0x7FFF_FFFF);
    }

    fn encode_continuation(&self, frame: &ContinuationFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.end_headers {
            flags::END_HEADERS
        } else {
            0
        };
        let length = frame.header_block.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + frame.header_block.len());
        self.write_header(
            buf,
            length,
            FrameType::Continuation as u8,
            frame_flags,
            frame.stream_id,
        );
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_unknown(&self, frame: &UnknownFrame, buf: &mut BytesMut) {
        let length = frame.payload.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        self.write_header(buf, length, frame.frame_type, frame.flags, frame.stream_id);
        buf.extend_from_slice(&frame.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn data_frame_layout() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Data(DataFrame {
                stream_id: StreamId::new(1),
                end_stream: true,
                data: Bytes::from_static(b"hello"),
            }),
            &mut buf,
        );

        assert_eq!(
            &buf[..],
            &[
                0x00, 0x00, 0x05, // length 5
                0x00, // DATA
                0x01, // END_STREAM
                0x00, 0x00, 0x00, 0x01, // stream 1
                b'h', b'e', b'l', b'l', b'o',
            ]
        );
    }

    #[test]
    fn headers_frame_flags() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Headers(HeadersFrame {
                stream_id: StreamId::new(3),
                end_stream: false,
                end_headers: true,
                header_block: Bytes::from_static(&[0x82]),
            }),
            &mut buf,
        );

        assert_eq!(buf[3], 0x01); // HEADERS
        assert_eq!(buf[4], flags::END_HEADERS);
        assert_eq!(&buf[5..9], &[0, 0, 0, 3]);
    }

    #[test]
    fn settings_frame_payload() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Settings(SettingsFrame {
                ack: false,
                settings: vec![Setting {
                    id: SettingId::MaxFrameSize,
                    value: 16384,
                }],
            }),
            &mut buf,
        );

        assert_eq!(&buf[..3], &[0, 0, 6]);
        assert_eq!(buf[3], 0x04);
        assert_eq!(&buf[9..11], &[0x00, 0x05]); // MAX_FRAME_SIZE id
        assert_eq!(&buf[11..15], &[0x00, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn settings_ack_is_empty() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Settings(SettingsFrame {
                ack: true,
                settings: vec![],
            }),
            &mut buf,
        );
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        assert_eq!(buf[4], flags::ACK);
    }

    #[test]
    fn ping_frame_echo_payload() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Ping(PingFrame {
                ack: true,
                data: [1, 2, 3, 4, 5, 6, 7, 8],
            }),
            &mut buf,
        );
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 8);
        assert_eq!(buf[4], flags::ACK);
        assert_eq!(&buf[9..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn window_update_clears_reserved_bit() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                increment: 0xFFFF_FFFF,
            }),
            &mut buf,
        );
        assert_eq!(&buf[9..13], &[0x7F, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn rst_stream_layout() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::RstStream(RstStreamFrame {
                stream_id: StreamId::new(7),
                error_code: 0x8, // CANCEL
            }),
            &mut buf,
        );
        assert_eq!(&buf[..3], &[0, 0, 4]);
        assert_eq!(buf[3], 0x03);
        assert_eq!(&buf[9..13], &[0, 0, 0, 8]);
    }

    #[test]
    fn goaway_layout() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::GoAway(GoAwayFrame {
                last_stream_id: StreamId::new(5),
                error_code: 0,
                debug_data: Bytes::from_static(b"bye"),
            }),
            &mut buf,
        );
        assert_eq!(&buf[..3], &[0, 0, 11]);
        assert_eq!(&buf[9..13], &[0, 0, 0, 5]);
        assert_eq!(&buf[17..], b"bye");
    }
}
