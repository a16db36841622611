//! Resource paths, document keys and field paths.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Field path segment that stands for the document key.
pub const DOCUMENT_KEY_FIELD: &str = "__name__";

/// Compares two path segments the way the backend does.
///
/// Segments of the form `__id<n>__` are numeric ids: they sort before every
/// other segment and among themselves by value. Everything else compares by
/// UTF-8 byte order.
pub fn compare_segments(a: &str, b: &str) -> Ordering {
    match (numeric_id(a), numeric_id(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn numeric_id(segment: &str) -> Option<i64> {
    segment
        .strip_prefix("__id")
        .and_then(|rest| rest.strip_suffix("__"))
        .and_then(|digits| digits.parse().ok())
}

fn compare_segment_lists(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = compare_segments(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// A slash-separated path to a collection or document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The empty path (database root).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-separated path. Leading and trailing slashes are
    /// ignored; empty segments in the middle are rejected.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(ProtocolError::invalid_path(path, "empty segment"));
        }
        Ok(Self { segments })
    }

    /// Builds a path from segments.
    pub fn from_segments<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns this path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.segments.split_last()?;
        Some(Self {
            segments: head.to_vec(),
        })
    }

    /// Whether `self` is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Slash-joined form.
    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_segment_lists(&self.segments, &other.segments)
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// The key of a document: a resource path with an even number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    /// Creates a key from a path, which must name a document.
    pub fn from_path(path: ResourcePath) -> ProtocolResult<Self> {
        if path.is_empty() || path.len() % 2 != 0 {
            return Err(ProtocolError::invalid_path(
                path.canonical_string(),
                "document keys need an even, non-zero number of segments",
            ));
        }
        Ok(Self { path })
    }

    /// Parses a key such as `rooms/eros/messages/1`.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        Self::from_path(ResourcePath::parse(path)?)
    }

    /// The full path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The document id (last segment).
    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// Path of the collection holding this document.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent().unwrap_or_default()
    }

    /// Id of the collection holding this document.
    pub fn collection_id(&self) -> &str {
        let segments = self.path.segments();
        segments
            .len()
            .checked_sub(2)
            .and_then(|i| segments.get(i))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

/// A dot-separated path to a (possibly nested) document field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted field path such as `address.city`.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let field = Self::from_dotted(path);
        field.validate()?;
        Ok(field)
    }

    /// Splits on dots without validation; [`FieldPath::validate`] reports
    /// problems later.
    pub fn from_dotted(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Builds a field path from raw segments (which may contain dots).
    pub fn from_segments<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The `__name__` path, addressing the document key.
    pub fn document_key() -> Self {
        Self::from_segments([DOCUMENT_KEY_FIELD])
    }

    /// Whether this path addresses the document key.
    pub fn is_document_key(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_FIELD
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Checks that the path is non-empty and has no empty segments.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.segments.is_empty() || self.segments.iter().any(String::is_empty) {
            return Err(ProtocolError::invalid_path(
                self.canonical_string(),
                "field paths need non-empty segments",
            ));
        }
        Ok(())
    }

    /// Dot-joined form.
    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl Ord for FieldPath {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_segment_lists(&self.segments, &other.segments)
    }
}

impl PartialOrd for FieldPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::from_dotted(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}
