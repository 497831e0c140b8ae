//! HPACK header coding (RFC 7541), literal subset.
//!
//! This implementation keeps no dynamic table: every header this side
//! emits is a literal-without-indexing field, and Huffman coding is
//! never used. The decoder additionally resolves indexed fields against
//! the 61-entry static table and accepts all three literal forms, which
//! is enough to interoperate with peers that index aggressively as long
//! as they leave the dynamic table empty. Huffman-coded strings and
//! dynamic-table references are rejected as malformed.

mod decode;
mod encode;
pub mod integer;
mod table;

pub use decode::decode_block;
pub use encode::{encode_block, encode_field};
pub use table::{HeaderField, StaticTable};

use std::fmt;

/// HPACK coding errors.
#[derive(Debug, PartialEq, Eq)]
pub enum HpackError {
    /// Input ended inside a field representation.
    Truncated,
    /// Integer continuation exceeded the permitted length.
    IntegerOverflow,
    /// A declared string length runs past the input.
    BadStringLength { length: usize, available: usize },
    /// Table index is zero or outside the static table.
    InvalidIndex(u64),
    /// Peer sent a Huffman-coded string, which this subset rejects.
    Huffman,
}

impl fmt::Display for HpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpackError::Truncated => write!(f, "truncated header block"),
            HpackError::IntegerOverflow => write!(f, "integer continuation overflow"),
            HpackError::BadStringLength { length, available } => {
                write!(
                    f,
                    "string length {} exceeds remaining input {}",
                    length, available
                )
            }
            HpackError::InvalidIndex(idx) => write!(f, "invalid table index {}", idx),
            HpackError::Huffman => write!(f, "huffman-coded strings are not supported"),
        }
    }
}

impl std::error::Error for HpackError {}
