//! Per-target accumulation of document changes between consistency markers.
//!
//! ```text
//! Uninitialized -> Accumulating -> Consistent -> Accumulating -> ...
//!                        ^                            |
//!                        +-------- reset -------------+
//! ```
//!
//! Document changes overwrite each other per key until the server marks the
//! target consistent; only then does the View see them.

use crate::view::View;
use docwatch_protocol::{DocumentKey, DocumentSnapshot};
use std::collections::BTreeMap;

/// State of a target's aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// No acknowledgement from the server yet.
    Uninitialized,
    /// Collecting changes for the next consistent snapshot.
    Accumulating,
    /// Everything received has been handed to the view.
    Consistent,
}

/// Latest pending change for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    /// The document was added or updated.
    Upsert(DocumentSnapshot),
    /// The document was deleted or left the target.
    Remove,
}

/// Pending changes keyed by document, last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeSet {
    changes: BTreeMap<DocumentKey, PendingChange>,
}

impl PendingChangeSet {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an added or updated document.
    pub fn upsert(&mut self, document: DocumentSnapshot) {
        self.changes
            .insert(document.key().clone(), PendingChange::Upsert(document));
    }

    /// Records a removal.
    pub fn remove(&mut self, key: DocumentKey) {
        self.changes.insert(key, PendingChange::Remove);
    }

    /// Pending change for `key`.
    pub fn get(&self, key: &DocumentKey) -> Option<&PendingChange> {
        self.changes.get(key)
    }

    /// Pending changes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&DocumentKey, &PendingChange)> {
        self.changes.iter()
    }

    /// Pending upserts in key order.
    pub fn upserts(&self) -> impl Iterator<Item = &DocumentSnapshot> {
        self.changes.values().filter_map(|change| match change {
            PendingChange::Upsert(doc) => Some(doc),
            PendingChange::Remove => None,
        })
    }

    /// Number of keys with a pending change.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Accumulator for one target.
#[derive(Debug)]
pub struct TargetAggregator {
    state: AggregatorState,
    pending: PendingChangeSet,
    full_replacement: bool,
}

impl TargetAggregator {
    /// Creates an aggregator for a freshly added target.
    pub fn new() -> Self {
        Self {
            state: AggregatorState::Uninitialized,
            pending: PendingChangeSet::new(),
            full_replacement: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> AggregatorState {
        self.state
    }

    /// Whether the next consistent change set replaces the view wholesale.
    pub fn is_full_replacement(&self) -> bool {
        self.full_replacement
    }

    /// Changes received since the last marker.
    pub fn pending(&self) -> &PendingChangeSet {
        &self.pending
    }

    /// The server acknowledged the target.
    pub fn target_added(&mut self) {
        if self.state == AggregatorState::Uninitialized {
            self.state = AggregatorState::Accumulating;
        }
    }

    /// A document was added or updated.
    pub fn document_changed(&mut self, document: DocumentSnapshot) {
        self.state = AggregatorState::Accumulating;
        self.pending.upsert(document);
    }

    /// A document was removed.
    pub fn document_removed(&mut self, key: DocumentKey) {
        self.state = AggregatorState::Accumulating;
        self.pending.remove(key);
    }

    /// Drops pending changes; the next change set is a full replacement.
    pub fn reset(&mut self) {
        self.pending = PendingChangeSet::new();
        self.full_replacement = true;
        self.state = AggregatorState::Accumulating;
    }

    /// Drops pending changes for a new stream. The server resends from the
    /// resume token, or everything when `full_replacement` is set.
    pub fn restart(&mut self, full_replacement: bool) {
        self.pending = PendingChangeSet::new();
        self.full_replacement = self.full_replacement || full_replacement;
        self.state = AggregatorState::Uninitialized;
    }

    /// Number of documents the target would hold if it became consistent now.
    pub fn local_count(&self, view: &View) -> usize {
        if self.full_replacement {
            return self.pending.upserts().count();
        }
        let mut count = view.len();
        for (key, change) in self.pending.iter() {
            match (change, view.contains(key)) {
                (PendingChange::Upsert(_), false) => count += 1,
                (PendingChange::Remove, true) => count -= 1,
                _ => {}
            }
        }
        count
    }

    /// Takes the accumulated change set at a consistency marker.
    ///
    /// Returns the changes and whether they replace the view wholesale.
    pub fn mark_consistent(&mut self) -> (PendingChangeSet, bool) {
        self.state = AggregatorState::Consistent;
        let full = std::mem::take(&mut self.full_replacement);
        (std::mem::take(&mut self.pending), full)
    }
}

impl Default for TargetAggregator {
    fn default() -> Self {
        Self::new()
    }
}
