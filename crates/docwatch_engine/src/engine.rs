//! The watch engine facade.

use crate::config::WatchConfig;
use crate::error::{WatchError, WatchResult};
use crate::listener::{dispatch_error, ErrorCallback, ListenerEntry, ListenerRegistration, SnapshotCallback};
use crate::snapshot::QuerySnapshot;
use crate::stream::{Command, StreamManager, StreamState};
use crate::target::{Target, TargetRegistry};
use crate::transport::WatchTransport;
use docwatch_protocol::{translate_query, CborDocumentDecoder, DocumentDecoder, QueryDescriptor, TargetId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Streams opened successfully.
    pub streams_opened: u64,
    /// Reconnects scheduled after stream failures.
    pub reconnects: u64,
    /// Target resets, requested by the server or forced by existence filters.
    pub resets: u64,
    /// Snapshots handed to listeners.
    pub snapshots_delivered: u64,
    /// Live targets.
    pub active_targets: usize,
    /// Live targets that are consistent with the server.
    pub current_targets: usize,
    /// Registered listeners.
    pub active_listeners: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) streams_opened: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) resets: AtomicU64,
    pub(crate) snapshots_delivered: AtomicU64,
}

/// State shared by the facade, the stream task and listener handles.
///
/// Locks are taken registry first, then target.
pub(crate) struct EngineInner {
    pub(crate) config: WatchConfig,
    pub(crate) transport: Arc<dyn WatchTransport>,
    pub(crate) decoder: Arc<dyn DocumentDecoder>,
    pub(crate) registry: Mutex<TargetRegistry>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    /// Only changed while holding the registry lock.
    pub(crate) shutting_down: AtomicBool,
    pub(crate) next_target_id: AtomicI32,
    pub(crate) stream_state: RwLock<StreamState>,
    pub(crate) counters: Counters,
    pub(crate) closed: watch::Sender<bool>,
}

impl EngineInner {
    /// Detaches a listener. The last listener of a target takes the target
    /// with it.
    pub(crate) fn remove_listener(&self, entry: &ListenerEntry) {
        let target_id = entry.target_id();
        let emptied = {
            let mut registry = self.registry.lock();
            let Some(target) = registry.get(target_id) else {
                return;
            };
            let mut target = target.lock();
            target.remove_listener(entry.id());
            if target.listener_count() == 0 {
                drop(target);
                registry.remove(target_id);
                true
            } else {
                false
            }
        };

        debug!(listener = %entry.id(), target_id = %target_id, "listener removed");
        if emptied {
            let _ = self.commands.send(Command::Unlisten(target_id));
        }
    }

    fn active_listeners(registry: &TargetRegistry) -> usize {
        registry.all().iter().map(|t| t.lock().listener_count()).sum()
    }
}

/// Realtime query watch engine.
///
/// Owns one watch stream shared by every query. Listeners on identical
/// queries share one server target.
///
/// # Example
///
/// ```rust,no_run
/// use docwatch_engine::{MockTransport, WatchConfig, WatchEngine};
/// use docwatch_protocol::{FieldOperator, QueryDescriptor, Value};
/// use std::sync::Arc;
///
/// # async fn run() -> docwatch_engine::WatchResult<()> {
/// let (transport, _server) = MockTransport::new();
/// let engine = WatchEngine::start(WatchConfig::default(), Arc::new(transport))?;
///
/// let query = QueryDescriptor::collection("cities")
///     .where_field("population", FieldOperator::GreaterThan, Value::Integer(1_000_000))
///     .limit(10);
/// let registration = engine.listen(
///     &query,
///     |snapshot| println!("{} cities", snapshot.len()),
///     |error| eprintln!("listen failed: {error}"),
/// )?;
///
/// registration.remove();
/// engine.shutdown(true)?;
/// # Ok(())
/// # }
/// ```
pub struct WatchEngine {
    inner: Arc<EngineInner>,
}

impl WatchEngine {
    /// Starts an engine on the current Tokio runtime. Documents are decoded
    /// with [`CborDocumentDecoder`].
    pub fn start(config: WatchConfig, transport: Arc<dyn WatchTransport>) -> WatchResult<Self> {
        Self::start_with_decoder(config, transport, Arc::new(CborDocumentDecoder))
    }

    /// Starts an engine with a custom document decoder.
    pub fn start_with_decoder(
        config: WatchConfig,
        transport: Arc<dyn WatchTransport>,
        decoder: Arc<dyn DocumentDecoder>,
    ) -> WatchResult<Self> {
        let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            config,
            transport,
            decoder,
            registry: Mutex::new(TargetRegistry::default()),
            commands,
            shutting_down: AtomicBool::new(false),
            next_target_id: AtomicI32::new(1),
            stream_state: RwLock::new(StreamState::Disconnected),
            counters: Counters::default(),
            closed,
        });

        runtime.spawn(StreamManager::new(Arc::clone(&inner), receiver).run());
        info!("watch engine started");
        Ok(Self { inner })
    }

    /// Registers a listener for `query`.
    ///
    /// `on_snapshot` receives a snapshot each time the result set changes.
    /// `on_error` is invoked at most once, after which the listener is dead.
    /// Callbacks run on the engine's stream task and must not block.
    pub fn listen<S, E>(
        &self,
        query: &QueryDescriptor,
        on_snapshot: S,
        on_error: E,
    ) -> WatchResult<ListenerRegistration>
    where
        S: Fn(&QuerySnapshot) + Send + Sync + 'static,
        E: Fn(&WatchError) + Send + Sync + 'static,
    {
        let query = translate_query(query).map_err(|e| WatchError::InvalidQuery(e.to_string()))?;
        let on_snapshot: SnapshotCallback = Box::new(on_snapshot);
        let on_error: ErrorCallback = Box::new(on_error);

        let (entry, command) = {
            let mut registry = self.inner.registry.lock();
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(WatchError::ShutdownInProgress);
            }

            if let Some(existing) = registry.find(&query.canonical_id) {
                let mut target = existing.lock();
                let primed = !target.has_snapshot();
                let entry = Arc::new(ListenerEntry::new(target.id(), on_snapshot, on_error, primed));
                target.add_listener(Arc::clone(&entry));
                debug!(target_id = %target.id(), listener = %entry.id(), "joined existing target");
                let command = (!primed).then(|| Command::Prime {
                    target_id: target.id(),
                    listener_id: entry.id(),
                });
                (entry, command)
            } else {
                let id = TargetId::new(self.inner.next_target_id.fetch_add(1, Ordering::SeqCst));
                let mut target = Target::new(id, query);
                let entry = Arc::new(ListenerEntry::new(id, on_snapshot, on_error, true));
                target.add_listener(Arc::clone(&entry));
                debug!(target_id = %id, query = %target.canonical_id(), "created target");
                registry.insert(target);
                (entry, Some(Command::Listen(id)))
            }
        };

        if let Some(command) = command {
            self.inner
                .commands
                .send(command)
                .map_err(|_| WatchError::ShutdownInProgress)?;
        }
        Ok(ListenerRegistration::new(entry, Arc::downgrade(&self.inner)))
    }

    /// Shuts the engine down.
    ///
    /// A graceful shutdown is refused with [`WatchError::StillListening`]
    /// while listeners are registered, and nothing changes. A forced
    /// shutdown terminates every listener with [`WatchError::Cancelled`].
    /// Once shut down, further calls succeed and do nothing.
    pub fn shutdown(&self, graceful: bool) -> WatchResult<()> {
        let targets = {
            let mut registry = self.inner.registry.lock();
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            if graceful {
                let active = EngineInner::active_listeners(&registry);
                if active > 0 {
                    return Err(WatchError::StillListening { active });
                }
            }
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            registry.drain()
        };

        let _ = self.inner.commands.send(Command::Shutdown);

        let listeners: Vec<_> = targets
            .iter()
            .flat_map(|target| target.lock().take_listeners())
            .collect();
        info!(graceful, listeners = listeners.len(), "watch engine shutting down");
        dispatch_error(&WatchError::Cancelled, &listeners);
        Ok(())
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Current state of the watch stream.
    pub fn stream_state(&self) -> StreamState {
        *self.inner.stream_state.read()
    }

    /// Waits until the stream task has stopped.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Engine counters.
    pub fn stats(&self) -> WatchStats {
        let counters = &self.inner.counters;
        let (active_targets, current_targets, active_listeners) = {
            let registry = self.inner.registry.lock();
            let targets = registry.all();
            let current = targets.iter().filter(|t| t.lock().is_current()).count();
            (registry.len(), current, EngineInner::active_listeners(&registry))
        };
        WatchStats {
            streams_opened: counters.streams_opened.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            resets: counters.resets.load(Ordering::Relaxed),
            snapshots_delivered: counters.snapshots_delivered.load(Ordering::Relaxed),
            active_targets,
            current_targets,
            active_listeners,
        }
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        let _ = self.shutdown(false);
    }
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("stream_state", &self.stream_state())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
