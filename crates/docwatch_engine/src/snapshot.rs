//! Query snapshots and document changes handed to listeners.

use docwatch_protocol::{DocumentKey, DocumentSnapshot, Timestamp};

/// Kind of a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The document entered the result set.
    Added,
    /// The document changed content or position.
    Modified,
    /// The document left the result set.
    Removed,
}

/// One change between two consecutive snapshots.
///
/// Indices describe the sequence as it evolves while the changes are applied
/// in order: `old_index` is the position the document is taken from,
/// `new_index` the position it is inserted at. `Added` has no old index,
/// `Removed` no new index and `Modified` has both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    change_type: ChangeType,
    document: DocumentSnapshot,
    old_index: Option<usize>,
    new_index: Option<usize>,
}

impl DocumentChange {
    /// A document inserted at `new_index`.
    pub fn added(document: DocumentSnapshot, new_index: usize) -> Self {
        Self {
            change_type: ChangeType::Added,
            document,
            old_index: None,
            new_index: Some(new_index),
        }
    }

    /// A document moved or updated from `old_index` to `new_index`.
    pub fn modified(document: DocumentSnapshot, old_index: usize, new_index: usize) -> Self {
        Self {
            change_type: ChangeType::Modified,
            document,
            old_index: Some(old_index),
            new_index: Some(new_index),
        }
    }

    /// A document taken out from `old_index`.
    pub fn removed(document: DocumentSnapshot, old_index: usize) -> Self {
        Self {
            change_type: ChangeType::Removed,
            document,
            old_index: Some(old_index),
            new_index: None,
        }
    }

    /// Change kind.
    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// The document: its new version, or the last version for removals.
    pub fn document(&self) -> &DocumentSnapshot {
        &self.document
    }

    /// Key of the changed document.
    pub fn key(&self) -> &DocumentKey {
        self.document.key()
    }

    /// Position the document was taken from.
    pub fn old_index(&self) -> Option<usize> {
        self.old_index
    }

    /// Position the document was inserted at.
    pub fn new_index(&self) -> Option<usize> {
        self.new_index
    }
}

/// The result set of a query at one point in time, plus the changes since
/// the previous snapshot delivered to the same listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySnapshot {
    documents: Vec<DocumentSnapshot>,
    changes: Vec<DocumentChange>,
    read_time: Timestamp,
    from_cache: bool,
}

impl QuerySnapshot {
    pub(crate) fn new(
        documents: Vec<DocumentSnapshot>,
        changes: Vec<DocumentChange>,
        read_time: Timestamp,
    ) -> Self {
        Self {
            documents,
            changes,
            read_time,
            from_cache: false,
        }
    }

    /// Documents in query order.
    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// Changes since the previous snapshot, removals first.
    pub fn changes(&self) -> &[DocumentChange] {
        &self.changes
    }

    /// Time the result set is consistent at.
    pub fn read_time(&self) -> Timestamp {
        self.read_time
    }

    /// Always false: results come straight from the stream.
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Ids of the documents, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(DocumentSnapshot::id).collect()
    }
}
