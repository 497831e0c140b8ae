//! Header block decoding.

use super::integer;
use super::table::{HeaderField, StaticTable};
use super::HpackError;

/// Decode a complete header block into fields, preserving order.
pub fn decode_block(input: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let (field, consumed) = decode_field(&input[pos..])?;
        if let Some(field) = field {
            fields.push(field);
        }
        pos += consumed;
    }

    Ok(fields)
}

/// Decode one field representation. Returns `None` for representations
/// that carry no field (dynamic table size updates).
fn decode_field(input: &[u8]) -> Result<(Option<HeaderField>, usize), HpackError> {
    debug_assert!(!input.is_empty());
    let first = input[0];

    if first & 0x80 != 0 {
        // Indexed field (Section 6.1): 1xxxxxxx.
        let (index, consumed) = integer::decode(input, 7)?;
        let field = lookup(index)?;
        Ok((Some(field), consumed))
    } else if first & 0x40 != 0 {
        // Literal with incremental indexing (Section 6.2.1): 01xxxxxx.
        // Accepted from peers; the field is not retained since no
        // dynamic table is kept.
        decode_literal(input, 6)
    } else if first & 0x20 != 0 {
        // Dynamic table size update (Section 6.3): 001xxxxx. Parsed and
        // discarded; a peer shrinking a table we do not keep is a no-op.
        let (_, consumed) = integer::decode(input, 5)?;
        Ok((None, consumed))
    } else {
        // Literal without indexing (0000xxxx) or never-indexed
        // (0001xxxx): both use a 4-bit name index prefix.
        decode_literal(input, 4)
    }
}

fn decode_literal(
    input: &[u8],
    prefix_bits: u8,
) -> Result<(Option<HeaderField>, usize), HpackError> {
    let (name_index, mut consumed) = integer::decode(input, prefix_bits)?;

    let name = if name_index > 0 {
        lookup(name_index)?.name
    } else {
        let (name, used) = decode_string(&input[consumed..])?;
        consumed += used;
        name
    };

    let (value, used) = decode_string(&input[consumed..])?;
    consumed += used;

    Ok((Some(HeaderField { name, value }), consumed))
}

/// Resolve a wire index. Only the static table exists; anything past it
/// would reference a dynamic table entry this decoder never created.
fn lookup(index: u64) -> Result<HeaderField, HpackError> {
    usize::try_from(index)
        .ok()
        .and_then(StaticTable::get)
        .ok_or(HpackError::InvalidIndex(index))
}

/// Decode a length-prefixed string (Section 5.2).
fn decode_string(input: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    if input.is_empty() {
        return Err(HpackError::Truncated);
    }

    if input[0] & 0x80 != 0 {
        return Err(HpackError::Huffman);
    }

    let (length, mut consumed) = integer::decode(input, 7)?;
    let length = length as usize;
    let available = input.len() - consumed;
    if length > available {
        return Err(HpackError::BadStringLength { length, available });
    }

    let data = input[consumed..consumed + length].to_vec();
    consumed += length;
    Ok((data, consumed))
}

#[cfg(test)]
mod tests {
    use super::super::encode::{encode_block, encode_field};
    use super::*;

    #[test]
    fn roundtrip_preserves_order_and_values() {
        let fields = vec![
            HeaderField::new("content-type", "application/grpc"),
            HeaderField::new("user-agent", "x/1"),
            HeaderField::new("grpc-status", "0"),
        ];

        let mut block = Vec::new();
        encode_block(&fields, &mut block);

        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn roundtrip_binary_value() {
        let fields = vec![HeaderField::new("meta-bin", vec![0u8, 1, 2, 0xff, 0x80])];
        let mut block = Vec::new();
        encode_block(&fields, &mut block);
        assert_eq!(decode_block(&block).unwrap(), fields);
    }

    #[test]
    fn empty_block_is_empty() {
        assert_eq!(decode_block(&[]).unwrap(), vec![]);
    }

    #[test]
    fn indexed_static_field() {
        // 0x82 = indexed, static table entry 2 (:method GET).
        let decoded = decode_block(&[0x82]).unwrap();
        assert_eq!(decoded, vec![HeaderField::new(":method", "GET")]);
    }

    #[test]
    fn literal_with_static_name_index() {
        // 0x41 = literal-with-indexing, name from index 1 (:authority).
        let mut block = vec![0x41];
        block.push(9);
        block.extend_from_slice(b"localhost");
        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded, vec![HeaderField::new(":authority", "localhost")]);
    }

    #[test]
    fn never_indexed_literal() {
        // 0x10 = never-indexed, literal name.
        let mut block = vec![0x10];
        block.push(3);
        block.extend_from_slice(b"key");
        block.push(5);
        block.extend_from_slice(b"value");
        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded, vec![HeaderField::new("key", "value")]);
    }

    #[test]
    fn table_size_update_skipped() {
        // 0x3f 0xe1 0x1f = size update to 4096, then an indexed field.
        let decoded = decode_block(&[0x3f, 0xe1, 0x1f, 0x82]).unwrap();
        assert_eq!(decoded, vec![HeaderField::new(":method", "GET")]);
    }

    #[test]
    fn dynamic_table_index_rejected() {
        // Index 62 is the first dynamic entry; none exists.
        let err = decode_block(&[0xbe]).unwrap_err();
        assert_eq!(err, HpackError::InvalidIndex(62));
    }

    #[test]
    fn index_zero_rejected() {
        assert_eq!(decode_block(&[0x80]).unwrap_err(), HpackError::InvalidIndex(0));
    }

    #[test]
    fn huffman_string_rejected() {
        // Literal with Huffman bit set on the name length.
        let block = vec![0x00, 0x81, 0xff];
        assert_eq!(decode_block(&block).unwrap_err(), HpackError::Huffman);
    }

    #[test]
    fn truncated_value_rejected() {
        let mut block = Vec::new();
        encode_field(b"key", b"value", &mut block);
        block.truncate(block.len() - 2);
        assert!(matches!(
            decode_block(&block).unwrap_err(),
            HpackError::BadStringLength { .. }
        ));
    }

    #[test]
    fn truncated_length_rejected() {
        // Name length prefix promises continuation that never comes.
        let block = vec![0x00, 0x7f];
        assert_eq!(decode_block(&block).unwrap_err(), HpackError::Truncated);
    }

    #[test]
    fn declared_length_past_input_rejected() {
        let block = vec![0x00, 10, b'a', b'b'];
        assert!(matches!(
            decode_block(&block).unwrap_err(),
            HpackError::BadStringLength {
                length: 10,
                available: 2
            }
        ));
    }
}
