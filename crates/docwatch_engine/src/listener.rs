//! Listener registrations and snapshot fan-out.

use crate::engine::EngineInner;
use crate::error::WatchError;
use crate::snapshot::QuerySnapshot;
use docwatch_protocol::TargetId;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;
use uuid::Uuid;

/// Callback receiving query snapshots.
pub type SnapshotCallback = Box<dyn Fn(&QuerySnapshot) + Send + Sync>;

/// Callback receiving the terminal error of a listener.
pub type ErrorCallback = Box<dyn Fn(&WatchError) + Send + Sync>;

/// Unique id of a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One registered listener.
///
/// `active` flips to false exactly once, either on removal or on a terminal
/// error; whoever flips it owns the terminal notification. `primed` is set
/// once the listener has seen its first snapshot, so fan-out never hands a
/// late joiner a delta before its starting snapshot.
pub(crate) struct ListenerEntry {
    id: ListenerId,
    target_id: TargetId,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
    active: AtomicBool,
    primed: AtomicBool,
}

impl ListenerEntry {
    pub(crate) fn new(
        target_id: TargetId,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
        primed: bool,
    ) -> Self {
        Self {
            id: ListenerId::new(),
            target_id,
            on_snapshot,
            on_error,
            active: AtomicBool::new(true),
            primed: AtomicBool::new(primed),
        }
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_primed(&self) -> bool {
        self.primed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_primed(&self) {
        self.primed.store(true, Ordering::SeqCst);
    }

    /// Returns true if this call deactivated the listener.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Invokes the snapshot callback, isolating panics.
    pub(crate) fn deliver(&self, snapshot: &QuerySnapshot) -> bool {
        if !self.is_active() {
            return false;
        }
        if catch_unwind(AssertUnwindSafe(|| (self.on_snapshot)(snapshot))).is_err() {
            warn!(listener = %self.id, target = %self.target_id, "snapshot listener panicked");
        }
        true
    }

    /// Deactivates the listener and invokes the error callback, unless the
    /// listener was already inactive.
    pub(crate) fn terminate(&self, error: &WatchError) -> bool {
        if !self.deactivate() {
            return false;
        }
        if catch_unwind(AssertUnwindSafe(|| (self.on_error)(error))).is_err() {
            warn!(listener = %self.id, target = %self.target_id, "error listener panicked");
        }
        true
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("active", &self.is_active())
            .field("primed", &self.is_primed())
            .finish_non_exhaustive()
    }
}

/// Delivers `snapshot` to every primed, active listener in order.
/// Returns the number of deliveries.
pub(crate) fn dispatch_snapshot(snapshot: &QuerySnapshot, listeners: &[Arc<ListenerEntry>]) -> u64 {
    let mut delivered = 0;
    for listener in listeners {
        if listener.is_primed() && listener.deliver(snapshot) {
            delivered += 1;
        }
    }
    delivered
}

/// Terminates every listener with `error`.
pub(crate) fn dispatch_error(error: &WatchError, listeners: &[Arc<ListenerEntry>]) {
    for listener in listeners {
        listener.terminate(error);
    }
}

/// Handle returned by [`WatchEngine::listen`](crate::WatchEngine::listen).
///
/// Dropping the handle does not stop the listener; call
/// [`remove`](ListenerRegistration::remove). Removal is idempotent and may be
/// called from inside the listener's own callbacks.
#[derive(Clone)]
pub struct ListenerRegistration {
    entry: Arc<ListenerEntry>,
    engine: Weak<EngineInner>,
}

impl ListenerRegistration {
    pub(crate) fn new(entry: Arc<ListenerEntry>, engine: Weak<EngineInner>) -> Self {
        Self { entry, engine }
    }

    /// Registration id.
    pub fn id(&self) -> ListenerId {
        self.entry.id()
    }

    /// Target the listener is attached to.
    pub fn target_id(&self) -> TargetId {
        self.entry.target_id()
    }

    /// Whether the listener can still receive events.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Stops the listener. No callbacks are invoked afterwards, except one
    /// already running.
    pub fn remove(&self) {
        if !self.entry.deactivate() {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_listener(&self.entry);
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id())
            .field("target_id", &self.target_id())
            .field("active", &self.is_active())
            .finish()
    }
}
