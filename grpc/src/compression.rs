//! Message compression codec.
//!
//! Implements the `grpc-encoding` algorithms this runtime negotiates:
//! `identity`, `gzip`, and `deflate` (zlib format). A message whose
//! compressed flag is set is passed through [`decompress`] with the
//! algorithm announced in the peer's metadata before delivery.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Algorithm {
    /// Parse a `grpc-encoding` header value. Unknown algorithms return
    /// `None`; the caller responds with `UNIMPLEMENTED`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "identity" | "" => Some(Algorithm::Identity),
            "gzip" => Some(Algorithm::Gzip),
            "deflate" => Some(Algorithm::Deflate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Identity => "identity",
            Algorithm::Gzip => "gzip",
            Algorithm::Deflate => "deflate",
        }
    }

    pub fn is_identity(self) -> bool {
        self == Algorithm::Identity
    }
}

/// Compress a payload. `identity` copies.
pub fn compress(payload: &[u8], algorithm: Algorithm) -> io::Result<Bytes> {
    match algorithm {
        Algorithm::Identity => Ok(Bytes::copy_from_slice(payload)),
        Algorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            Ok(Bytes::from(encoder.finish()?))
        }
        Algorithm::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            Ok(Bytes::from(encoder.finish()?))
        }
    }
}

/// Decompress a payload. `identity` copies.
pub fn decompress(payload: &[u8], algorithm: Algorithm) -> io::Result<Bytes> {
    match algorithm {
        Algorithm::Identity => Ok(Bytes::copy_from_slice(payload)),
        Algorithm::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(payload).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        Algorithm::Deflate => {
            let mut out = Vec::new();
            ZlibDecoder::new(payload).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
    }
}
