use std::fmt;

use num::bigint::Sign;
use num::{BigInt, Signed, ToPrimitive, Zero};

/// The radix stack items are serialized in while at rest on the stack.
pub const STACK_RADIX: u32 = 16;

/// A single stack value: an arbitrary-precision signed integer.
///
/// Byte payloads (hashes, keys, addresses) convert through the unsigned
/// big-endian magnitude, so a value and the bytes it came from always agree
/// modulo leading zero bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Value(pub BigInt);

impl Value {
    pub fn zero() -> Self {
        Value(BigInt::zero())
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Value(BigInt::from_bytes_be(Sign::Plus, b))
    }

    pub fn from_bool(b: bool) -> Self {
        if b {
            Value(BigInt::from(1))
        } else {
            Value::zero()
        }
    }

    /// The big-endian magnitude. Zero renders as the empty byte string.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.0.is_zero() {
            return vec![];
        }
        self.0.magnitude().to_bytes_be()
    }

    /// The magnitude left-padded with zeroes to exactly `width` bytes.
    ///
    /// Magnitude conversion drops leading zero bytes, so fixed-width payloads
    /// (signatures, message hashes) are re-padded before use.
    pub fn to_bytes_padded(&self, width: usize) -> Option<Vec<u8>> {
        let raw = self.to_bytes();
        if raw.len() > width {
            return None;
        }
        let mut out = vec![0u8; width - raw.len()];
        out.extend_from_slice(&raw);
        Some(out)
    }

    pub fn as_bool(&self) -> bool {
        !self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.0.to_u64()
    }

    pub fn to_usize(&self) -> Option<usize> {
        self.0.to_usize()
    }

    /// Serialized form used on the stack.
    pub fn serialize(&self) -> String {
        self.0.to_str_radix(STACK_RADIX)
    }

    /// Parses the serialized stack form.
    pub fn deserialize(s: &str) -> Option<Self> {
        BigInt::parse_bytes(s.as_bytes(), STACK_RADIX).map(Value)
    }

    /// The value reinterpreted as UTF-8 text, for operands that carry
    /// chain identifiers or address strings.
    pub fn to_utf8(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }
}

impl From<BigInt> for Value {
    fn from(i: BigInt) -> Self {
        Value(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value(BigInt::from(i))
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value(BigInt::from(i))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_modulo_leading_zeroes() {
        let v = Value::from_bytes(&[0x02, 0xab, 0xcd]);
        assert_eq!(v.to_bytes(), vec![0x02, 0xab, 0xcd]);
        // leading zeroes are not representable in the magnitude
        let v = Value::from_bytes(&[0x00, 0x01]);
        assert_eq!(v.to_bytes(), vec![0x01]);
        assert_eq!(v.to_bytes_padded(2).unwrap(), vec![0x00, 0x01]);
    }

    #[test]
    fn serialized_form_round_trips() {
        for i in [-255i64, -1, 0, 1, 16, 255, 1_000_000] {
            let v = Value::from(i);
            assert_eq!(Value::deserialize(&v.serialize()).unwrap(), v);
        }
    }

    #[test]
    fn padding_refuses_to_truncate() {
        let v = Value::from_bytes(&[1, 2, 3, 4]);
        assert!(v.to_bytes_padded(3).is_none());
    }

    #[test]
    fn utf8_view_matches_source_text() {
        let v = Value::from_bytes(b"btc");
        assert_eq!(v.to_utf8(), "btc");
    }
}
