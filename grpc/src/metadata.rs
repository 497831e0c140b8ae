//! Call metadata and the `grpc-timeout` wire format.

use std::time::Duration;

/// Ordered key/value metadata attached to calls.
///
/// Keys are ASCII and normalized to lowercase; values are arbitrary
/// bytes (binary headers are legal on the wire). Insertion order is
/// preserved end-to-end, so iteration yields entries exactly as they
/// were added and as they will appear in the header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<u8>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Duplicate keys are allowed and keep their
    /// relative order.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// First value for a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// First value for a key, as UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All values for a key, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> Vec<&'a [u8]> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.add(key, value);
        }
        metadata
    }
}

const HOUR: u64 = 3_600_000_000_000;
const MINUTE: u64 = 60_000_000_000;
const SECOND: u64 = 1_000_000_000;
const MILLI: u64 = 1_000_000;
const MICRO: u64 = 1_000;

/// The wire grammar allows at most eight digits (`1*8DIGIT`).
const MAX_TIMEOUT_VALUE: u64 = 99_999_999;

/// Unit scales in nanoseconds, finest first.
const UNITS: [(u64, char); 6] = [
    (1, 'n'),
    (MICRO, 'u'),
    (MILLI, 'm'),
    (SECOND, 'S'),
    (MINUTE, 'M'),
    (HOUR, 'H'),
];

/// `grpc-timeout` header codec.
///
/// Format is `<value><unit>` with units `n`, `u`, `m`, `S`, `M`, `H`
/// and a value of at most eight digits.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    nanos: u64,
}

impl Timeout {
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Render the timeout for the wire.
    ///
    /// Prefers the coarsest unit that represents the value exactly.
    /// When no exact rendering fits the eight-digit limit, the value is
    /// rounded up in the finest unit that does fit; over-reporting by a
    /// fraction of a unit never shortens the peer's deadline.
    pub fn to_wire(self) -> String {
        for &(scale, suffix) in UNITS.iter().rev() {
            if self.nanos >= scale && self.nanos % scale == 0 {
                let value = self.nanos / scale;
                if value <= MAX_TIMEOUT_VALUE {
                    return format!("{}{}", value, suffix);
                }
            }
        }

        for &(scale, suffix) in UNITS.iter() {
            let value = self.nanos.div_ceil(scale);
            if value <= MAX_TIMEOUT_VALUE {
                return format!("{}{}", value, suffix);
            }
        }

        // u64 nanoseconds top out near 5.1 million hours, well inside
        // eight digits.
        format!("{}H", self.nanos.div_ceil(HOUR))
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 2 {
            return None;
        }
        let (value, unit) = s.split_at(s.len() - 1);
        let value: u64 = value.parse().ok()?;
        let nanos = match unit {
            "n" => value,
            "u" => value.checked_mul(1_000)?,
            "m" => value.checked_mul(1_000_000)?,
            "S" => value.checked_mul(1_000_000_000)?,
            "M" => value.checked_mul(60_000_000_000)?,
            "H" => value.checked_mul(3_600_000_000_000)?,
            _ => return None,
        };
        Some(Self { nanos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_preserved() {
        let mut md = Metadata::new();
        md.add("b-key", "2");
        md.add("a-key", "1");
        md.add("b-key", "3");

        let order: Vec<&str> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["b-key", "a-key", "b-key"]);
    }

    #[test]
    fn keys_normalized_to_lowercase() {
        let mut md = Metadata::new();
        md.add("Content-Type", "application/grpc");
        assert_eq!(md.get_str("content-type"), Some("application/grpc"));
        assert_eq!(md.get_str("CONTENT-TYPE"), Some("application/grpc"));
        assert_eq!(md.iter().next().unwrap().0, "content-type");
    }

    #[test]
    fn duplicate_keys_keep_order() {
        let mut md = Metadata::new();
        md.add("key", "first");
        md.add("key", "second");
        assert_eq!(md.get("key"), Some(&b"first"[..]));
        assert_eq!(md.get_all("key"), vec![&b"first"[..], &b"second"[..]]);
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn binary_values_survive() {
        let mut md = Metadata::new();
        md.add("trace-bin", vec![0u8, 0xff, 0x7f, 1]);
        assert_eq!(md.get("trace-bin"), Some(&[0u8, 0xff, 0x7f, 1][..]));
        // Not valid UTF-8, so the string accessor refuses it.
        assert!(md.get_str("trace-bin").is_none());
    }

    #[test]
    fn missing_key() {
        let md = Metadata::new();
        assert!(md.get("absent").is_none());
        assert!(md.get_all("absent").is_empty());
        assert!(!md.contains_key("absent"));
        assert!(md.is_empty());
    }

    #[test]
    fn from_iterator_collects_in_order() {
        let md: Metadata = vec![
            ("one".to_string(), b"1".to_vec()),
            ("two".to_string(), b"2".to_vec()),
        ]
        .into_iter()
        .collect();
        assert_eq!(md.len(), 2);
        assert_eq!(md.iter().next().unwrap().0, "one");
    }

    #[test]
    fn timeout_wire_format() {
        assert_eq!(Timeout::from_duration(Duration::from_secs(10)).to_wire(), "10S");
        assert_eq!(
            Timeout::from_duration(Duration::from_millis(500)).to_wire(),
            "500m"
        );
        assert_eq!(
            Timeout::from_duration(Duration::from_secs(3600)).to_wire(),
            "1H"
        );
        assert_eq!(Timeout::from_duration(Duration::from_secs(90)).to_wire(), "90S");
    }

    #[test]
    fn timeout_parse_all_units() {
        assert_eq!(Timeout::parse("100n").unwrap().as_duration().as_nanos(), 100);
        assert_eq!(Timeout::parse("50u").unwrap().as_duration().as_micros(), 50);
        assert_eq!(Timeout::parse("200m").unwrap().as_duration().as_millis(), 200);
        assert_eq!(Timeout::parse("30S").unwrap().as_duration().as_secs(), 30);
        assert_eq!(Timeout::parse("5M").unwrap().as_duration().as_secs(), 300);
        assert_eq!(Timeout::parse("2H").unwrap().as_duration().as_secs(), 7200);
    }

    #[test]
    fn timeout_parse_rejects_garbage() {
        assert!(Timeout::parse("").is_none());
        assert!(Timeout::parse("S").is_none());
        assert!(Timeout::parse("10x").is_none());
        assert!(Timeout::parse("10s").is_none());
        assert!(Timeout::parse("abcS").is_none());
    }

    #[test]
    fn timeout_roundtrip() {
        for duration in [
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::from_micros(250),
        ] {
            let wire = Timeout::from_duration(duration).to_wire();
            assert_eq!(Timeout::parse(&wire).unwrap().as_duration(), duration);
        }
    }

    #[test]
    fn timeout_ragged_nanos_round_up_within_digit_limit() {
        // A deadline delta is almost never unit-aligned; the rendering
        // must still fit eight digits and never shorten the timeout.
        let timeout = Timeout {
            nanos: 4_999_983_712,
        };
        let wire = timeout.to_wire();
        assert_eq!(wire, "4999984u");
        assert!(Timeout::parse(&wire).unwrap().as_duration() >= timeout.as_duration());
    }

    #[test]
    fn timeout_value_never_exceeds_eight_digits() {
        for nanos in [
            0u64,
            1,
            999,
            99_999_999,
            100_000_001,
            4_999_983_712,
            59_999_999_999,
            1_000_000_000_000_000_000,
            3_600_000_000_000_000_000,
        ] {
            let wire = Timeout { nanos }.to_wire();
            let digits = &wire[..wire.len() - 1];
            assert!(
                (1..=8).contains(&digits.len()),
                "{} renders as {:?}",
                nanos,
                wire
            );
            assert!(Timeout::parse(&wire).is_some(), "{:?} must parse", wire);
        }
    }

    #[test]
    fn timeout_rounding_never_under_reports() {
        for nanos in [1u64, 1_234_567_891, 98_765_432_109, 7_000_000_000_001] {
            let timeout = Timeout { nanos };
            let parsed = Timeout::parse(&timeout.to_wire()).unwrap();
            assert!(parsed.as_duration() >= timeout.as_duration());
        }
    }
}
