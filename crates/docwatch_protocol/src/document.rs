//! Immutable document snapshots and the decoder that produces them.

use crate::error::{ProtocolError, ProtocolResult};
use crate::path::{DocumentKey, FieldPath};
use docwatch_codec::{from_cbor, to_canonical_cbor, Timestamp, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One version of a document: key, field values and revision marker.
///
/// Snapshots are never mutated. Fields sit behind an `Arc` so the same
/// snapshot can be held by a view and by every query snapshot handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    fields: Arc<BTreeMap<String, Value>>,
    create_time: Timestamp,
    update_time: Timestamp,
}

impl DocumentSnapshot {
    /// Creates a snapshot. The create time defaults to `update_time`.
    pub fn new(key: DocumentKey, fields: BTreeMap<String, Value>, update_time: Timestamp) -> Self {
        Self {
            key,
            fields: Arc::new(fields),
            create_time: update_time,
            update_time,
        }
    }

    /// Sets the create time.
    pub fn with_create_time(mut self, create_time: Timestamp) -> Self {
        self.create_time = create_time;
        self
    }

    /// Document key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Document id (last key segment).
    pub fn id(&self) -> &str {
        self.key.id()
    }

    /// Top-level fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// When the document was created.
    pub fn create_time(&self) -> Timestamp {
        self.create_time
    }

    /// Revision marker: when this version was written.
    pub fn update_time(&self) -> Timestamp {
        self.update_time
    }

    /// Looks up a possibly nested field. `__name__` is not a stored field;
    /// ordering handles it separately.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Whether two snapshots carry the same field content.
    pub fn has_same_content(&self, other: &DocumentSnapshot) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields) || self.fields == other.fields
    }

    /// The document as a single map value in the wire layout.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("name", Value::from(self.key.path().canonical_string())),
            ("fields", Value::Map((*self.fields).clone())),
            ("create_time", Value::Timestamp(self.create_time)),
            ("update_time", Value::Timestamp(self.update_time)),
        ])
    }

    /// Encodes the document in the layout [`CborDocumentDecoder`] reads.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(to_canonical_cbor(&self.to_value())?)
    }
}

/// Turns wire bytes into document snapshots.
pub trait DocumentDecoder: Send + Sync {
    /// Decodes one document.
    fn decode_document(&self, bytes: &[u8]) -> ProtocolResult<DocumentSnapshot>;
}

/// Decodes documents stored as canonical CBOR maps with `name`, `fields`,
/// `create_time` and `update_time` entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborDocumentDecoder;

impl DocumentDecoder for CborDocumentDecoder {
    fn decode_document(&self, bytes: &[u8]) -> ProtocolResult<DocumentSnapshot> {
        let value = from_cbor(bytes)?;
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::invalid_document("expected map"))?;

        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_document("missing name"))?;
        let key = DocumentKey::parse(name)?;

        let fields = match map.get("fields") {
            Some(Value::Map(fields)) => fields.clone(),
            None => BTreeMap::new(),
            Some(other) => {
                return Err(ProtocolError::invalid_document(format!(
                    "fields must be a map, found {}",
                    other.type_name()
                )))
            }
        };

        let update_time = map
            .get("update_time")
            .and_then(Value::as_timestamp)
            .ok_or_else(|| ProtocolError::invalid_document("missing update_time"))?;
        let create_time = map
            .get("create_time")
            .and_then(Value::as_timestamp)
            .unwrap_or(update_time);

        Ok(DocumentSnapshot::new(key, fields, update_time).with_create_time(create_time))
    }
}
