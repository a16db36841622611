//! Canonical CBOR decoder.

use crate::encoder::canonical_key_order;
use crate::error::{CodecError, CodecResult};
use crate::tags;
use crate::value::{Timestamp, Value};
use std::collections::BTreeMap;

/// Decode a value from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid canonical CBOR, use a tag this
/// crate does not know, or leave trailing bytes after the value.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = CanonicalDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A canonical CBOR decoder.
///
/// This decoder validates that input follows canonical CBOR rules
/// and rejects forbidden constructs.
pub struct CanonicalDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Maximum allowed element count for arrays and maps.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum allowed byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum nesting of arrays and maps.
const MAX_DEPTH: usize = 100;

impl<'a> CanonicalDecoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Decode the next value.
    pub fn decode(&mut self) -> CodecResult<Value> {
        let initial_byte = self.read_byte()?;
        let major_type = initial_byte >> 5;
        let additional_info = initial_byte & 0x1f;

        match major_type {
            0 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            1 => {
                let n = self.decode_unsigned(additional_info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-n - 1))
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            2 => {
                let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => self.decode_text(additional_info).map(Value::String),
            4 => {
                let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
                self.nested(|d| {
                    let mut items = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        items.push(d.decode()?);
                    }
                    Ok(Value::Array(items))
                })
            }
            5 => self.decode_map(additional_info),
            6 => {
                let tag = self.decode_unsigned(additional_info)?;
                self.decode_tagged(tag)
            }
            7 => self.decode_simple(additional_info),
            _ => Err(CodecError::invalid_structure("invalid major type")),
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::invalid_structure("nesting too deep"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof)?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn decode_unsigned(&mut self, additional_info: u8) -> CodecResult<u64> {
        let non_canonical =
            || CodecError::invalid_structure("non-canonical: value could be encoded in fewer bytes");
        match additional_info {
            0..=23 => Ok(u64::from(additional_info)),
            24 => {
                let byte = self.read_byte()?;
                if byte < 24 {
                    return Err(non_canonical());
                }
                Ok(u64::from(byte))
            }
            25 => {
                let bytes = self.read_bytes(2)?;
                let value = u16::from_be_bytes([bytes[0], bytes[1]]);
                if u8::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            26 => {
                let bytes = self.read_bytes(4)?;
                let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if u16::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(u64::from(value))
            }
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                let value = u64::from_be_bytes(buf);
                if u32::try_from(value).is_ok() {
                    return Err(non_canonical());
                }
                Ok(value)
            }
            31 => Err(CodecError::IndefiniteLengthForbidden),
            _ => Err(CodecError::invalid_structure("reserved additional info")),
        }
    }

    fn decode_length(&mut self, additional_info: u8, max_allowed: u64) -> CodecResult<usize> {
        let claimed = self.decode_unsigned(additional_info)?;
        if claimed > max_allowed {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::SizeLimitExceeded {
            claimed,
            max_allowed,
        })
    }

    fn decode_text(&mut self, additional_info: u8) -> CodecResult<String> {
        let len = self.decode_length(additional_info, MAX_BYTES_LENGTH)?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn expect_text(&mut self) -> CodecResult<String> {
        let initial_byte = self.read_byte()?;
        if initial_byte >> 5 != 3 {
            return Err(CodecError::invalid_structure("expected text string"));
        }
        self.decode_text(initial_byte & 0x1f)
    }

    fn expect_array_header(&mut self, expected: Option<usize>) -> CodecResult<usize> {
        let initial_byte = self.read_byte()?;
        if initial_byte >> 5 != 4 {
            return Err(CodecError::invalid_structure("expected array"));
        }
        let len = self.decode_length(initial_byte & 0x1f, MAX_CONTAINER_ELEMENTS)?;
        match expected {
            Some(n) if n != len => Err(CodecError::invalid_structure(format!(
                "expected array of {n} items, found {len}"
            ))),
            _ => Ok(len),
        }
    }

    fn expect_integer(&mut self) -> CodecResult<i64> {
        match self.decode()? {
            Value::Integer(n) => Ok(n),
            other => Err(CodecError::invalid_structure(format!(
                "expected integer, found {}",
                other.type_name()
            ))),
        }
    }

    fn expect_double(&mut self) -> CodecResult<f64> {
        match self.decode()? {
            Value::Double(d) => Ok(d),
            other => Err(CodecError::invalid_structure(format!(
                "expected double, found {}",
                other.type_name()
            ))),
        }
    }

    fn decode_map(&mut self, additional_info: u8) -> CodecResult<Value> {
        let len = self.decode_length(additional_info, MAX_CONTAINER_ELEMENTS)?;
        self.nested(|d| {
            let mut fields = BTreeMap::new();
            let mut prev_key: Option<String> = None;

            for _ in 0..len {
                let key = d.expect_text()?;
                if let Some(prev) = &prev_key {
                    if canonical_key_order(prev, &key) != std::cmp::Ordering::Less {
                        return Err(CodecError::invalid_structure(
                            "non-canonical: map keys not in sorted order",
                        ));
                    }
                }
                let value = d.decode()?;
                fields.insert(key.clone(), value);
                prev_key = Some(key);
            }

            Ok(Value::Map(fields))
        })
    }

    fn decode_tagged(&mut self, tag: u64) -> CodecResult<Value> {
        match tag {
            tags::TIMESTAMP => {
                self.expect_array_header(Some(2))?;
                let seconds = self.expect_integer()?;
                let nanos = self.expect_integer()?;
                let nanos = i32::try_from(nanos)
                    .ok()
                    .filter(|n| (0..1_000_000_000).contains(n))
                    .ok_or_else(|| CodecError::invalid_structure("timestamp nanos out of range"))?;
                Ok(Value::Timestamp(Timestamp::new(seconds, nanos)))
            }
            tags::REFERENCE => self.expect_text().map(Value::Reference),
            tags::GEO_POINT => {
                self.expect_array_header(Some(2))?;
                let latitude = self.expect_double()?;
                let longitude = self.expect_double()?;
                Ok(Value::GeoPoint {
                    latitude,
                    longitude,
                })
            }
            tags::VECTOR => {
                let len = self.expect_array_header(None)?;
                let mut components = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    components.push(self.expect_double()?);
                }
                Ok(Value::Vector(components))
            }
            other => Err(CodecError::unsupported_type(format!("tag {other}"))),
        }
    }

    fn decode_simple(&mut self, additional_info: u8) -> CodecResult<Value> {
        match additional_info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            25 | 26 => Err(CodecError::NonCanonicalFloat),
            27 => {
                let bytes = self.read_bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(Value::Double(f64::from_bits(u64::from_be_bytes(buf))))
            }
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            _ => Err(CodecError::unsupported_type(format!(
                "simple value {additional_info}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_canonical_cbor;

    #[test]
    fn decode_scalars() {
        assert_eq!(from_cbor(&[0xf6]).unwrap(), Value::Null);
        assert_eq!(from_cbor(&[0xf5]).unwrap(), Value::Bool(true));
        assert_eq!(from_cbor(&[0x18, 255]).unwrap(), Value::Integer(255));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
        assert_eq!(
            from_cbor(&[0x65, b'h', b'e', b'l', b'l', b'o']).unwrap(),
            Value::from("hello")
        );
    }

    #[test]
    fn decode_tagged_values() {
        let value = Value::map([
            ("at", Value::Timestamp(Timestamp::new(1_700_000_000, 5))),
            ("ref", Value::reference("rooms/a/messages/b")),
            (
                "where",
                Value::GeoPoint {
                    latitude: 51.5,
                    longitude: -0.12,
                },
            ),
            ("embedding", Value::Vector(vec![0.25, 0.5])),
        ]);
        let bytes = to_canonical_cbor(&value).unwrap();
        assert_eq!(from_cbor(&bytes).unwrap(), value);
    }

    #[test]
    fn reject_short_floats() {
        assert!(matches!(
            from_cbor(&[0xf9, 0x00, 0x00]),
            Err(CodecError::NonCanonicalFloat)
        ));
        assert!(matches!(
            from_cbor(&[0xfa, 0x00, 0x00, 0x00, 0x00]),
            Err(CodecError::NonCanonicalFloat)
        ));
    }

    #[test]
    fn reject_indefinite_length() {
        assert!(matches!(
            from_cbor(&[0x5f, 0x41, b'a', 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
        assert!(matches!(
            from_cbor(&[0x9f, 0x01, 0xff]),
            Err(CodecError::IndefiniteLengthForbidden)
        ));
    }

    #[test]
    fn reject_non_shortest_encoding() {
        assert!(matches!(
            from_cbor(&[0x18, 23]),
            Err(CodecError::InvalidStructure { .. })
        ));
        assert!(matches!(
            from_cbor(&[0x19, 0x00, 0xff]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unsorted_or_non_text_map_keys() {
        // "b" before "a"
        assert!(matches!(
            from_cbor(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::InvalidStructure { .. })
        ));
        // integer key
        assert!(matches!(
            from_cbor(&[0xa1, 0x01, 0x01]),
            Err(CodecError::InvalidStructure { .. })
        ));
    }

    #[test]
    fn reject_unknown_tag() {
        // tag 1 (epoch date) wrapping 0
        assert!(matches!(
            from_cbor(&[0xc1, 0x00]),
            Err(CodecError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn reject_trailing_bytes_and_eof() {
        assert!(matches!(
            from_cbor(&[0x01, 0x02]),
            Err(CodecError::TrailingBytes { remaining: 1 })
        ));
        assert!(matches!(from_cbor(&[]), Err(CodecError::UnexpectedEof)));
        assert!(matches!(
            from_cbor(&[0x19, 0x01]),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn reject_integer_overflow() {
        let mut bytes = vec![0x1b];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(from_cbor(&bytes), Err(CodecError::IntegerOverflow)));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert!(matches!(
            from_cbor(&[0x62, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }
}
