//! The HPACK static table (RFC 7541 Appendix A).

/// A decoded header field. Names are ASCII; values may be arbitrary
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Entries 1..=61 of the static table. Index 0 is invalid on the wire.
const ENTRIES: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Lookup into the static table.
pub struct StaticTable;

impl StaticTable {
    /// Number of entries (61).
    pub const fn len() -> usize {
        ENTRIES.len()
    }

    /// Fetch entry by 1-based wire index.
    pub fn get(index: usize) -> Option<HeaderField> {
        if index == 0 || index > ENTRIES.len() {
            return None;
        }
        let (name, value) = ENTRIES[index - 1];
        Some(HeaderField::new(name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_61_entries() {
        assert_eq!(StaticTable::len(), 61);
    }

    #[test]
    fn index_zero_invalid() {
        assert!(StaticTable::get(0).is_none());
        assert!(StaticTable::get(62).is_none());
    }

    #[test]
    fn well_known_entries() {
        let field = StaticTable::get(2).unwrap();
        assert_eq!(field.name, b":method");
        assert_eq!(field.value, b"GET");

        let field = StaticTable::get(3).unwrap();
        assert_eq!(field.value, b"POST");

        let field = StaticTable::get(8).unwrap();
        assert_eq!(field.name, b":status");
        assert_eq!(field.value, b"200");

        let field = StaticTable::get(61).unwrap();
        assert_eq!(field.name, b"www-authenticate");
    }
}
