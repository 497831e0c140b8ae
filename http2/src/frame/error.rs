//! Frame-level errors and protocol error codes.

use std::fmt;

/// HTTP/2 error codes (RFC 7540 Section 7), carried by RST_STREAM and
/// GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            // Unknown codes are treated as INTERNAL_ERROR per the RFC.
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised while decoding a frame.
#[derive(Debug)]
pub enum FrameError {
    /// Frame length exceeds the negotiated maximum.
    FrameTooLarge { size: u32, max: u32 },
    /// The frame type requires a non-zero stream id.
    StreamRequired { frame_type: u8 },
    /// The frame type is only valid on stream 0.
    ConnectionOnly { frame_type: u8 },
    /// Payload length does not match the frame type's layout.
    BadLength { frame_type: u8, length: u32 },
    /// Declared padding exceeds the payload.
    BadPadding { pad_length: u8, payload_length: usize },
    /// WINDOW_UPDATE increment outside [1, 2^31-1].
    BadWindowIncrement { increment: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::FrameTooLarge { size, max } => {
                write!(f, "frame size {} exceeds maximum {}", size, max)
            }
            FrameError::StreamRequired { frame_type } => {
                write!(f, "frame type 0x{:02x} requires a stream id", frame_type)
            }
            FrameError::ConnectionOnly { frame_type } => {
                write!(f, "frame type 0x{:02x} only valid on stream 0", frame_type)
            }
            FrameError::BadLength { frame_type, length } => {
                write!(
                    f,
                    "invalid payload length {} for frame type 0x{:02x}",
                    length, frame_type
                )
            }
            FrameError::BadPadding {
                pad_length,
                payload_length,
            } => {
                write!(
                    f,
                    "padding length {} exceeds payload length {}",
                    pad_length, payload_length
                )
            }
            FrameError::BadWindowIncrement { increment } => {
                write!(f, "invalid window increment {}", increment)
            }
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        for code in 0x0..=0xdu32 {
            assert_eq!(ErrorCode::from_u32(code).to_u32(), code);
        }
    }

    #[test]
    fn error_code_unknown_maps_to_internal() {
        assert_eq!(ErrorCode::from_u32(0xe), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from_u32(u32::MAX), ErrorCode::InternalError);
    }

    #[test]
    fn error_code_display() {
        assert_eq!(format!("{}", ErrorCode::Cancel), "CANCEL");
        assert_eq!(
            format!("{}", ErrorCode::FlowControlError),
            "FLOW_CONTROL_ERROR"
        );
    }

    #[test]
    fn frame_error_display() {
        let err = FrameError::FrameTooLarge {
            size: 20000,
            max: 16384,
        };
        assert_eq!(format!("{}", err), "frame size 20000 exceeds maximum 16384");

        let err = FrameError::BadWindowIncrement { increment: 0 };
        assert_eq!(format!("{}", err), "invalid window increment 0");

        let err = FrameError::BadPadding {
            pad_length: 100,
            payload_length: 50,
        };
        assert_eq!(
            format!("{}", err),
            "padding length 100 exceeds payload length 50"
        );
    }

    #[test]
    fn frame_error_is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<FrameError>();
    }
}
