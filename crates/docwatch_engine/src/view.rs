//! The ordered result set of one target and its diff algorithm.

use crate::aggregator::{PendingChange, PendingChangeSet};
use crate::snapshot::DocumentChange;
use docwatch_protocol::{DocumentComparator, DocumentKey, DocumentSnapshot, FieldPath, OrderBy, QueryTarget};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Documents matching a target, in query order, with a key index.
#[derive(Debug, Clone)]
pub struct View {
    comparator: DocumentComparator,
    required_fields: Vec<FieldPath>,
    documents: Vec<DocumentSnapshot>,
    index: HashMap<DocumentKey, usize>,
}

/// Result of applying a change set to a view.
#[derive(Debug, Clone)]
pub struct ViewChange {
    /// The updated view.
    pub view: View,
    /// Changes in application order: removals, then insertions and moves.
    pub changes: Vec<DocumentChange>,
}

impl View {
    /// Creates an empty view for a translated query.
    pub fn new(target: &QueryTarget) -> Self {
        Self::with_order(target.order_by.clone())
    }

    /// Creates an empty view ordered by `order_by`. Documents missing a
    /// non-key ordered field never enter the view.
    pub fn with_order(order_by: Vec<OrderBy>) -> Self {
        let required_fields = order_by
            .iter()
            .map(|term| term.field.clone())
            .filter(|field| !field.is_document_key())
            .collect();
        Self {
            comparator: DocumentComparator::new(order_by),
            required_fields,
            documents: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Documents in order.
    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Whether `key` is in the view.
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.index.contains_key(key)
    }

    /// Position of `key`.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Current version of `key`.
    pub fn get(&self, key: &DocumentKey) -> Option<&DocumentSnapshot> {
        self.index_of(key).and_then(|i| self.documents.get(i))
    }

    /// Every document as `Added`, for listeners joining late.
    pub fn initial_changes(&self) -> Vec<DocumentChange> {
        self.documents
            .iter()
            .enumerate()
            .map(|(i, doc)| DocumentChange::added(doc.clone(), i))
            .collect()
    }

    fn matches(&self, document: &DocumentSnapshot) -> bool {
        self.required_fields
            .iter()
            .all(|field| document.get(field).is_some())
    }

    /// Applies a change set and computes the resulting changes.
    ///
    /// Removals are emitted first, in ascending position; each index is the
    /// position in the sequence as already updated by the previous changes.
    /// Insertions and updates follow in the new sort order. An update whose
    /// fields are unchanged emits nothing; the newer revision is kept.
    ///
    /// With `full_replacement`, documents not mentioned as upserts are
    /// removed; the rest is diffed against the current documents.
    pub fn apply(&self, pending: &PendingChangeSet, full_replacement: bool) -> ViewChange {
        let mut removed_positions: Vec<usize> = Vec::new();
        let mut upserts: Vec<&DocumentSnapshot> = Vec::new();

        for (key, change) in pending.iter() {
            match change {
                PendingChange::Upsert(doc) if self.matches(doc) => upserts.push(doc),
                _ => removed_positions.extend(self.index_of(key)),
            }
        }

        if full_replacement {
            let kept: HashSet<&DocumentKey> = upserts.iter().map(|doc| doc.key()).collect();
            removed_positions.extend(
                self.documents
                    .iter()
                    .enumerate()
                    .filter(|(_, doc)| !kept.contains(doc.key()))
                    .map(|(i, _)| i),
            );
        }

        removed_positions.sort_unstable();
        removed_positions.dedup();

        let mut working = self.documents.clone();
        let mut changes = Vec::new();

        for (n, old_position) in removed_positions.into_iter().enumerate() {
            let position = old_position - n;
            let doc = working.remove(position);
            changes.push(DocumentChange::removed(doc, position));
        }

        upserts.sort_by(|a, b| self.comparator.compare(a, b));

        for doc in upserts {
            match self.get(doc.key()) {
                Some(old) if old.has_same_content(doc) => {
                    if let Some(position) = self.position_in(&working, old) {
                        working[position] = doc.clone();
                    }
                }
                Some(old) => {
                    let Some(old_position) = self.position_in(&working, old) else {
                        continue;
                    };
                    working.remove(old_position);
                    let new_position = self.insertion_point(&working, doc);
                    working.insert(new_position, doc.clone());
                    changes.push(DocumentChange::modified(doc.clone(), old_position, new_position));
                }
                None => {
                    let new_position = self.insertion_point(&working, doc);
                    working.insert(new_position, doc.clone());
                    changes.push(DocumentChange::added(doc.clone(), new_position));
                }
            }
        }

        let index = working
            .iter()
            .enumerate()
            .map(|(i, doc)| (doc.key().clone(), i))
            .collect();

        ViewChange {
            view: View {
                comparator: self.comparator.clone(),
                required_fields: self.required_fields.clone(),
                documents: working,
                index,
            },
            changes,
        }
    }

    /// `working` stays sorted by each element's own content, so the stored
    /// version can be found by binary search.
    fn position_in(&self, working: &[DocumentSnapshot], stored: &DocumentSnapshot) -> Option<usize> {
        working
            .binary_search_by(|probe| self.comparator.compare(probe, stored))
            .ok()
            .or_else(|| working.iter().position(|d| d.key() == stored.key()))
    }

    fn insertion_point(&self, working: &[DocumentSnapshot], doc: &DocumentSnapshot) -> usize {
        working.partition_point(|probe| self.comparator.compare(probe, doc) == Ordering::Less)
    }
}
