//! Header block encoding.
//!
//! Every field is emitted as a literal header field without indexing
//! (RFC 7541 Section 6.2.2, representation octet `0x00`) with plain
//! octet strings. Nothing is ever added to a dynamic table and Huffman
//! coding is never used, so encoded blocks are self-contained.

use super::integer;
use super::table::HeaderField;

/// Encode a complete header block.
pub fn encode_block(fields: &[HeaderField], out: &mut Vec<u8>) {
    for field in fields {
        encode_field(&field.name, &field.value, out);
    }
}

/// Encode one literal-without-indexing field.
pub fn encode_field(name: &[u8], value: &[u8], out: &mut Vec<u8>) {
    // Representation octet: 0000xxxx with a zero name index, meaning the
    // name follows as a literal.
    out.push(0x00);
    encode_string(name, out);
    encode_string(value, out);
}

/// Encode a plain (non-Huffman) string: 7-bit-prefix length, then bytes.
fn encode_string(data: &[u8], out: &mut Vec<u8>) {
    integer::encode(data.len() as u64, 7, 0x00, out);
    out.extend_from_slice(data);
}
