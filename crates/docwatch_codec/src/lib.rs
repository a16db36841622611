//! # docwatch Codec
//!
//! Document field values and their canonical CBOR encoding.
//!
//! Documents arrive from the watch stream as opaque bytes. This crate
//! defines the [`Value`] model those bytes decode into and a deterministic
//! CBOR codec for it:
//! - Identical values produce identical bytes
//! - Decoding rejects anything that would not re-encode byte-for-byte
//!
//! ## Canonical CBOR Rules
//!
//! - Maps have text keys, sorted length-first then bytewise
//! - Integers use shortest encoding
//! - Doubles are always float64; NaN is written in a single quiet form
//! - No indefinite-length items
//! - Timestamps, references, geopoints and vectors use the semantic tags
//!   in [`tags`]
//!
//! ## Usage
//!
//! ```
//! use docwatch_codec::{to_canonical_cbor, from_cbor, Value};
//!
//! let value = Value::map([("title", Value::from("hello")), ("votes", Value::from(3))]);
//! let bytes = to_canonical_cbor(&value).unwrap();
//!
//! let decoded = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use value::{Timestamp, Value};

/// CBOR semantic tags for the non-primitive value types.
pub mod tags {
    /// `[seconds, nanos]` timestamp.
    pub const TIMESTAMP: u64 = 40_001;
    /// Document reference as a resource path string.
    pub const REFERENCE: u64 = 40_002;
    /// `[latitude, longitude]` pair of doubles.
    pub const GEO_POINT: u64 = 40_003;
    /// Array of doubles.
    pub const VECTOR: u64 = 40_004;
}

/// Trait for types that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this value to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
