//! # docwatch Protocol
//!
//! Types shared by the watch engine and its collaborators.
//!
//! This crate provides:
//! - Resource paths, document keys and field paths
//! - Immutable `DocumentSnapshot`s and the `DocumentDecoder` seam
//! - Query descriptors, effective ordering and `translate_query`
//! - The ordering module: backend collation for values and documents
//! - Watch stream messages (`ListenRequest`, `RawChange`, `Status`)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod messages;
mod order;
mod path;
mod query;

pub use document::{CborDocumentDecoder, DocumentDecoder, DocumentSnapshot};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ListenRequest, RawChange, Status, StatusCode, TargetId};
pub use order::{compare_documents, compare_values, DocumentComparator, TypeOrder};
pub use path::{compare_segments, DocumentKey, FieldPath, ResourcePath, DOCUMENT_KEY_FIELD};
pub use query::{
    translate_query, CompositeOperator, Cursor, Direction, FieldOperator, Filter, OrderBy,
    QueryDescriptor, QueryTarget, UnaryOperator,
};

pub use bytes::Bytes;
pub use docwatch_codec::{CodecError, Timestamp, Value};
