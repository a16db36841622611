//! Watch targets: one per distinct query, shared by its listeners.

use crate::aggregator::TargetAggregator;
use crate::error::WatchError;
use crate::listener::{ListenerEntry, ListenerId};
use crate::snapshot::QuerySnapshot;
use crate::view::View;
use bytes::Bytes;
use docwatch_protocol::{
    DocumentKey, DocumentSnapshot, ListenRequest, QueryTarget, Status, StatusCode, TargetId,
    Timestamp,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the stream manager must do after a target processed a message.
#[derive(Debug)]
pub(crate) enum TargetEvent {
    None,
    /// Deliver a snapshot to these listeners.
    Snapshot {
        snapshot: QuerySnapshot,
        listeners: Vec<Arc<ListenerEntry>>,
    },
    /// Re-add the target from scratch: remove it, then add it without a
    /// resume token.
    Resync,
    /// Terminate the target and all its listeners.
    Failed(WatchError),
}

/// Server-side watch state for one query.
#[derive(Debug)]
pub(crate) struct Target {
    id: TargetId,
    query: QueryTarget,
    resume_token: Option<Bytes>,
    current: bool,
    aggregator: TargetAggregator,
    view: View,
    has_snapshot: bool,
    read_time: Timestamp,
    listeners: Vec<Arc<ListenerEntry>>,
    consecutive_resets: u32,
    pending_remove_acks: u32,
}

impl Target {
    pub(crate) fn new(id: TargetId, query: QueryTarget) -> Self {
        let view = View::new(&query);
        Self {
            id,
            query,
            resume_token: None,
            current: false,
            aggregator: TargetAggregator::new(),
            view,
            has_snapshot: false,
            read_time: Timestamp::EPOCH,
            listeners: Vec::new(),
            consecutive_resets: 0,
            pending_remove_acks: 0,
        }
    }

    pub(crate) fn id(&self) -> TargetId {
        self.id
    }

    pub(crate) fn canonical_id(&self) -> &str {
        &self.query.canonical_id
    }

    pub(crate) fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn add_listener(&mut self, listener: Arc<ListenerEntry>) {
        self.listeners.push(listener);
    }

    pub(crate) fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id() != id);
        self.listeners.len() != before
    }

    pub(crate) fn take_listeners(&mut self) -> Vec<Arc<ListenerEntry>> {
        std::mem::take(&mut self.listeners)
    }

    /// Request adding this target to a stream.
    pub(crate) fn add_request(&self) -> ListenRequest {
        ListenRequest::AddTarget {
            target_id: self.id,
            query: self.query.clone(),
            resume_token: self.resume_token.clone(),
        }
    }

    /// Prepares for a new stream: the server resends from the resume token.
    pub(crate) fn restart(&mut self) {
        self.current = false;
        self.pending_remove_acks = 0;
        self.aggregator.restart(self.resume_token.is_none() && !self.view.is_empty());
    }

    /// Primes a late joiner. Returns the listener with its synthetic first
    /// snapshot, if the target already has one to offer.
    pub(crate) fn prime(&self, listener_id: ListenerId) -> Option<(Arc<ListenerEntry>, Option<QuerySnapshot>)> {
        let listener = self.listeners.iter().find(|l| l.id() == listener_id)?;
        listener.mark_primed();
        let snapshot = self.has_snapshot.then(|| {
            QuerySnapshot::new(
                self.view.documents().to_vec(),
                self.view.initial_changes(),
                self.read_time,
            )
        });
        Some((Arc::clone(listener), snapshot))
    }

    pub(crate) fn on_target_added(&mut self) -> TargetEvent {
        self.aggregator.target_added();
        TargetEvent::None
    }

    pub(crate) fn on_document_changed(&mut self, document: DocumentSnapshot) -> TargetEvent {
        self.aggregator.document_changed(document);
        TargetEvent::None
    }

    pub(crate) fn on_document_removed(&mut self, key: DocumentKey) -> TargetEvent {
        self.aggregator.document_removed(key);
        TargetEvent::None
    }

    pub(crate) fn on_reset(&mut self) -> TargetEvent {
        debug!(target_id = %self.id, "target reset by server");
        self.current = false;
        self.aggregator.reset();
        TargetEvent::None
    }

    /// Compares the server count with the local count. On mismatch the
    /// target is reset and must be re-added without a resume token, unless
    /// it already reset more than `max_resets` times in a row.
    pub(crate) fn on_existence_filter(&mut self, expected: usize, max_resets: u32) -> TargetEvent {
        let actual = self.aggregator.local_count(&self.view);
        if actual == expected {
            return TargetEvent::None;
        }

        self.consecutive_resets += 1;
        if self.consecutive_resets > max_resets {
            warn!(target_id = %self.id, expected, actual, "existence filter keeps mismatching");
            return TargetEvent::Failed(WatchError::ExistenceFilterMismatch {
                target_id: self.id,
                expected,
                actual,
            });
        }

        debug!(target_id = %self.id, expected, actual, "existence filter mismatch, resyncing");
        self.current = false;
        self.resume_token = None;
        self.pending_remove_acks += 1;
        self.aggregator.reset();
        TargetEvent::Resync
    }

    pub(crate) fn on_consistent(&mut self, resume_token: Bytes, read_time: Timestamp) -> TargetEvent {
        let (pending, full_replacement) = self.aggregator.mark_consistent();
        let result = self.view.apply(&pending, full_replacement);

        self.view = result.view;
        self.resume_token = Some(resume_token);
        self.read_time = read_time;
        self.current = true;
        self.consecutive_resets = 0;

        if self.has_snapshot && result.changes.is_empty() {
            return TargetEvent::None;
        }
        self.has_snapshot = true;

        TargetEvent::Snapshot {
            snapshot: QuerySnapshot::new(self.view.documents().to_vec(), result.changes, read_time),
            listeners: self.listeners.clone(),
        }
    }

    /// Handles a server-side removal. Removals we asked for while resyncing
    /// are expected; any other removal fails the target.
    pub(crate) fn on_removed_by_server(&mut self, cause: Option<Status>) -> TargetEvent {
        match cause {
            None if self.pending_remove_acks > 0 => {
                self.pending_remove_acks -= 1;
                TargetEvent::None
            }
            None => TargetEvent::Failed(WatchError::TargetRejected {
                target_id: self.id,
                status: Status::new(StatusCode::Cancelled, "target removed by server"),
            }),
            Some(status) => TargetEvent::Failed(WatchError::TargetRejected {
                target_id: self.id,
                status,
            }),
        }
    }

    /// Whether the target saw a consistency marker since the last (re)start.
    pub(crate) fn is_current(&self) -> bool {
        self.current
    }

    #[cfg(test)]
    pub(crate) fn resume_token(&self) -> Option<&Bytes> {
        self.resume_token.as_ref()
    }
}

/// Live targets, indexed by id and by canonical query id.
#[derive(Debug, Default)]
pub(crate) struct TargetRegistry {
    by_query: HashMap<String, TargetId>,
    targets: BTreeMap<TargetId, Arc<Mutex<Target>>>,
}

impl TargetRegistry {
    pub(crate) fn get(&self, id: TargetId) -> Option<Arc<Mutex<Target>>> {
        self.targets.get(&id).cloned()
    }

    pub(crate) fn find(&self, canonical_id: &str) -> Option<Arc<Mutex<Target>>> {
        self.by_query.get(canonical_id).and_then(|id| self.get(*id))
    }

    pub(crate) fn insert(&mut self, target: Target) -> Arc<Mutex<Target>> {
        let id = target.id();
        self.by_query.insert(target.canonical_id().to_string(), id);
        let target = Arc::new(Mutex::new(target));
        self.targets.insert(id, Arc::clone(&target));
        target
    }

    pub(crate) fn remove(&mut self, id: TargetId) -> Option<Arc<Mutex<Target>>> {
        let target = self.targets.remove(&id)?;
        self.by_query.retain(|_, v| *v != id);
        Some(target)
    }

    /// All targets in id order.
    pub(crate) fn all(&self) -> Vec<Arc<Mutex<Target>>> {
        self.targets.values().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Mutex<Target>>> {
        self.by_query.clear();
        std::mem::take(&mut self.targets).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
