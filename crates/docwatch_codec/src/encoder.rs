//! Canonical CBOR encoder.

use crate::error::CodecResult;
use crate::tags;
use crate::value::{Timestamp, Value};
use std::collections::BTreeMap;

/// Encode a value to canonical CBOR bytes.
///
/// This function produces deterministic output following the canonical
/// CBOR rules of RFC 8949 Section 4.2.1:
/// - Map keys are sorted by their encoded form (length-first, then bytewise)
/// - Integers use the shortest possible encoding
/// - Doubles are always written as 64-bit floats, NaN in its quiet form
/// - No indefinite-length encoding
///
/// # Errors
///
/// Returns an error if the value cannot be encoded.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// A canonical CBOR encoder.
pub struct CanonicalEncoder {
    buffer: Vec<u8>,
}

impl CanonicalEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a value.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.buffer.push(0xf6),
            Value::Bool(b) => self.buffer.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => self.encode_integer(*n),
            Value::Double(d) => self.encode_double(*d),
            Value::Timestamp(t) => self.encode_timestamp(*t),
            Value::String(s) => self.encode_text(s),
            Value::Bytes(b) => self.encode_bytes(b),
            Value::Reference(path) => {
                self.encode_unsigned(6, tags::REFERENCE);
                self.encode_text(path);
            }
            Value::GeoPoint {
                latitude,
                longitude,
            } => {
                self.encode_unsigned(6, tags::GEO_POINT);
                self.encode_unsigned(4, 2);
                self.encode_double(*latitude);
                self.encode_double(*longitude);
            }
            Value::Array(items) => {
                self.encode_unsigned(4, items.len() as u64);
                for item in items {
                    self.encode(item)?;
                }
            }
            Value::Vector(components) => {
                self.encode_unsigned(6, tags::VECTOR);
                self.encode_unsigned(4, components.len() as u64);
                for c in components {
                    self.encode_double(*c);
                }
            }
            Value::Map(fields) => self.encode_map(fields)?,
        }
        Ok(())
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn encode_integer(&mut self, n: i64) {
        if n >= 0 {
            self.encode_unsigned(0, n as u64);
        } else {
            // -1 encodes as 0, -2 as 1, ...
            let abs_minus_one = (-(n + 1)) as u64;
            self.encode_unsigned(1, abs_minus_one);
        }
    }

    fn encode_double(&mut self, d: f64) {
        let bits = if d.is_nan() {
            0x7ff8_0000_0000_0000
        } else {
            d.to_bits()
        };
        self.buffer.push(0xfb);
        self.buffer.extend_from_slice(&bits.to_be_bytes());
    }

    fn encode_timestamp(&mut self, t: Timestamp) {
        self.encode_unsigned(6, tags::TIMESTAMP);
        self.encode_unsigned(4, 2);
        self.encode_integer(t.seconds());
        self.encode_integer(i64::from(t.nanos()));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_unsigned(&mut self, major_type: u8, value: u64) {
        let mt = major_type << 5;

        if value < 24 {
            self.buffer.push(mt | (value as u8));
        } else if u8::try_from(value).is_ok() {
            self.buffer.push(mt | 24);
            self.buffer.push(value as u8);
        } else if u16::try_from(value).is_ok() {
            self.buffer.push(mt | 25);
            self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
        } else if u32::try_from(value).is_ok() {
            self.buffer.push(mt | 26);
            self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buffer.push(mt | 27);
            self.buffer.extend_from_slice(&value.to_be_bytes());
        }
    }

    fn encode_bytes(&mut self, bytes: &[u8]) {
        self.encode_unsigned(2, bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    fn encode_text(&mut self, text: &str) {
        self.encode_unsigned(3, text.len() as u64);
        self.buffer.extend_from_slice(text.as_bytes());
    }

    fn encode_map(&mut self, fields: &BTreeMap<String, Value>) -> CodecResult<()> {
        // Text keys share a major type, so encoded order is length-first, then bytewise.
        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort_by(|a, b| canonical_key_order(a, b));

        self.encode_unsigned(5, fields.len() as u64);
        for key in keys {
            self.encode_text(key);
            if let Some(value) = fields.get(key) {
                self.encode(value)?;
            }
        }
        Ok(())
    }
}

/// Canonical ordering of text map keys.
pub(crate) fn canonical_key_order(a: &str, b: &str) -> std::cmp::Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}
