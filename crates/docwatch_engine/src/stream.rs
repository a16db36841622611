//! The watch stream manager.
//!
//! One task per engine owns the physical stream. It processes engine
//! commands, inbound messages and the reconnect timer strictly one at a
//! time, which gives every target a single, ordered processing sequence.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming
//!      ^                            |
//!      +------ error / idle --------+
//! ```

use crate::engine::EngineInner;
use crate::error::{WatchError, WatchResult};
use crate::listener::{dispatch_error, dispatch_snapshot, ListenerId};
use crate::target::{Target, TargetEvent};
use crate::transport::WatchStream;
use docwatch_protocol::{ListenRequest, ProtocolError, RawChange, TargetId};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// State of the physical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream is open.
    Disconnected,
    /// A stream is being opened.
    Connecting,
    /// A stream is open and carrying targets.
    Streaming,
    /// The engine has shut down.
    Stopped,
}

impl StreamState {
    /// Returns true if a stream is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, StreamState::Streaming)
    }
}

/// Requests from the engine facade to the stream task.
#[derive(Debug)]
pub(crate) enum Command {
    /// A target was created and must be added to the stream.
    Listen(TargetId),
    /// A target lost its last listener and was dropped.
    Unlisten(TargetId),
    /// A listener joined a target that already delivered snapshots.
    Prime {
        target_id: TargetId,
        listener_id: ListenerId,
    },
    /// Stop the task.
    Shutdown,
}

struct ActiveStream {
    generation: u64,
    outbound: mpsc::UnboundedSender<ListenRequest>,
    inbound: mpsc::UnboundedReceiver<WatchResult<RawChange>>,
    added: HashSet<TargetId>,
}

pub(crate) struct StreamManager {
    inner: Arc<EngineInner>,
    commands: mpsc::UnboundedReceiver<Command>,
    stream: Option<ActiveStream>,
    generation: u64,
    attempt: u32,
    reconnect_at: Option<Instant>,
}

async fn next_message(stream: &mut Option<ActiveStream>) -> Option<WatchResult<RawChange>> {
    match stream {
        Some(stream) => stream.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl StreamManager {
    pub(crate) fn new(inner: Arc<EngineInner>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            inner,
            commands,
            stream: None,
            generation: 0,
            attempt: 0,
            reconnect_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                message = next_message(&mut self.stream) => self.handle_message(message),
                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.open_stream();
                }
            }
        }

        self.stream = None;
        self.reconnect_at = None;
        self.set_state(StreamState::Stopped);
        self.inner.closed.send_replace(true);
        info!("watch stream manager stopped");
    }

    fn set_state(&self, state: StreamState) {
        let mut current = self.inner.stream_state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "stream state");
            *current = state;
        }
    }

    fn lookup(&self, id: TargetId) -> Option<Arc<parking_lot::Mutex<Target>>> {
        self.inner.registry.lock().get(id)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen(id) => {
                let Some(target) = self.lookup(id) else {
                    return;
                };
                if let Some(stream) = self.stream.as_ref() {
                    // open_stream may already have added it
                    if stream.added.contains(&id) {
                        return;
                    }
                    let request = target.lock().add_request();
                    self.send(request);
                } else if self.reconnect_at.is_none() {
                    self.open_stream();
                }
            }
            Command::Unlisten(id) => {
                let added = self.stream.as_ref().is_some_and(|s| s.added.contains(&id));
                if added {
                    debug!(target_id = %id, "removing target");
                    self.send(ListenRequest::RemoveTarget { target_id: id });
                }
                self.close_if_idle();
            }
            Command::Prime {
                target_id,
                listener_id,
            } => {
                let Some(target) = self.lookup(target_id) else {
                    return;
                };
                let primed = target.lock().prime(listener_id);
                if let Some((listener, Some(snapshot))) = primed {
                    if listener.deliver(&snapshot) {
                        self.inner
                            .counters
                            .snapshots_delivered
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn open_stream(&mut self) {
        let targets = self.inner.registry.lock().all();
        if targets.is_empty() {
            self.set_state(StreamState::Disconnected);
            return;
        }

        self.set_state(StreamState::Connecting);
        match self.inner.transport.open_stream() {
            Ok(WatchStream { outbound, inbound }) => {
                self.generation += 1;
                self.inner
                    .counters
                    .streams_opened
                    .fetch_add(1, Ordering::Relaxed);
                info!(
                    generation = self.generation,
                    targets = targets.len(),
                    "watch stream opened"
                );
                self.stream = Some(ActiveStream {
                    generation: self.generation,
                    outbound,
                    inbound,
                    added: HashSet::new(),
                });
                self.set_state(StreamState::Streaming);

                for target in targets {
                    let request = {
                        let mut target = target.lock();
                        target.restart();
                        target.add_request()
                    };
                    self.send(request);
                    if self.stream.is_none() {
                        break;
                    }
                }
            }
            Err(error) => self.handle_stream_failure(error),
        }
    }

    /// Sends a request on the current stream, if any.
    fn send(&mut self, request: ListenRequest) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let id = request.target_id();
        let is_add = matches!(request, ListenRequest::AddTarget { .. });
        if stream.outbound.send(request).is_err() {
            self.handle_stream_failure(WatchError::transport_retryable("stream closed"));
            return;
        }
        if is_add {
            stream.added.insert(id);
        } else {
            stream.added.remove(&id);
        }
    }

    fn close_if_idle(&mut self) {
        if !self.inner.registry.lock().is_empty() {
            return;
        }
        if let Some(stream) = self.stream.take() {
            info!(generation = stream.generation, "no targets left, closing watch stream");
        }
        self.reconnect_at = None;
        self.set_state(StreamState::Disconnected);
    }

    fn handle_message(&mut self, message: Option<WatchResult<RawChange>>) {
        match message {
            Some(Ok(change)) => self.handle_change(change),
            Some(Err(error)) => self.handle_stream_failure(error),
            None => self.handle_stream_failure(WatchError::transport_retryable("stream closed by server")),
        }
    }

    fn handle_stream_failure(&mut self, error: WatchError) {
        let generation = self.stream.take().map(|s| s.generation);
        self.set_state(StreamState::Disconnected);

        if self.inner.registry.lock().is_empty() {
            self.reconnect_at = None;
            return;
        }

        if error.is_retryable() {
            let backoff = &self.inner.config.backoff;
            let delay = if error.is_resource_exhausted() {
                backoff.max_delay()
            } else {
                backoff.delay_for_attempt(self.attempt)
            };
            self.attempt = self.attempt.saturating_add(1);
            self.inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(
                ?generation,
                %error,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "watch stream failed, scheduling reconnect"
            );
            self.reconnect_at = Some(Instant::now() + delay);
        } else {
            warn!(?generation, %error, "watch stream failed permanently");
            self.reconnect_at = None;
            let targets = self.inner.registry.lock().drain();
            for target in targets {
                let listeners = target.lock().take_listeners();
                dispatch_error(&error, &listeners);
            }
        }
    }

    fn handle_change(&mut self, change: RawChange) {
        match change {
            RawChange::TargetAdded { target_id } => {
                self.with_target(target_id, Target::on_target_added);
            }
            RawChange::TargetRemoved { target_id, cause } => {
                if cause.is_some() {
                    if let Some(stream) = self.stream.as_mut() {
                        stream.added.remove(&target_id);
                    }
                }
                self.with_target(target_id, |t| t.on_removed_by_server(cause));
            }
            RawChange::DocumentChanged {
                key,
                data,
                target_ids,
                removed_target_ids,
                ..
            } => {
                let decoded = self
                    .inner
                    .decoder
                    .decode_document(&data)
                    .and_then(|doc| {
                        if doc.key() == &key {
                            Ok(doc)
                        } else {
                            Err(ProtocolError::invalid_document(format!(
                                "document {} delivered as {}",
                                doc.key(),
                                key
                            )))
                        }
                    });
                match decoded {
                    Ok(doc) => {
                        for id in target_ids {
                            self.with_target(id, |t| t.on_document_changed(doc.clone()));
                        }
                    }
                    Err(error) => {
                        let error = WatchError::from(error);
                        for id in target_ids {
                            self.fail_target(id, error.clone());
                        }
                    }
                }
                for id in removed_target_ids {
                    self.with_target(id, |t| t.on_document_removed(key.clone()));
                }
            }
            RawChange::DocumentRemoved { key, target_ids } => {
                for id in target_ids {
                    self.with_target(id, |t| t.on_document_removed(key.clone()));
                }
            }
            RawChange::TargetConsistent {
                target_id,
                resume_token,
                read_time,
            } => {
                if self.with_target(target_id, |t| t.on_consistent(resume_token, read_time)) {
                    self.attempt = 0;
                }
            }
            RawChange::TargetReset { target_id } => {
                if self.with_target(target_id, Target::on_reset) {
                    self.inner.counters.resets.fetch_add(1, Ordering::Relaxed);
                }
            }
            RawChange::ExistenceFilterMismatch {
                target_id,
                expected_count,
            } => {
                let max_resets = self.inner.config.max_consecutive_resets;
                self.with_target(target_id, |t| t.on_existence_filter(expected_count, max_resets));
            }
        }
    }

    /// Runs `f` on a live target and acts on the outcome. Messages for
    /// unknown targets are dropped.
    fn with_target(&mut self, id: TargetId, f: impl FnOnce(&mut Target) -> TargetEvent) -> bool {
        let Some(target) = self.lookup(id) else {
            debug!(target_id = %id, "message for unknown target ignored");
            return false;
        };
        let event = f(&mut *target.lock());
        self.handle_event(id, event);
        true
    }

    fn handle_event(&mut self, id: TargetId, event: TargetEvent) {
        match event {
            TargetEvent::None => {}
            TargetEvent::Snapshot {
                snapshot,
                listeners,
            } => {
                let delivered = dispatch_snapshot(&snapshot, &listeners);
                self.inner
                    .counters
                    .snapshots_delivered
                    .fetch_add(delivered, Ordering::Relaxed);
            }
            TargetEvent::Resync => {
                self.inner.counters.resets.fetch_add(1, Ordering::Relaxed);
                self.send(ListenRequest::RemoveTarget { target_id: id });
                if let Some(target) = self.lookup(id) {
                    let request = target.lock().add_request();
                    self.send(request);
                }
            }
            TargetEvent::Failed(error) => self.fail_target(id, error),
        }
    }

    fn fail_target(&mut self, id: TargetId, error: WatchError) {
        let Some(target) = self.inner.registry.lock().remove(id) else {
            return;
        };
        warn!(target_id = %id, %error, "target terminated");

        let added = self.stream.as_ref().is_some_and(|s| s.added.contains(&id));
        if added {
            self.send(ListenRequest::RemoveTarget { target_id: id });
        }

        let listeners = target.lock().take_listeners();
        dispatch_error(&error, &listeners);
        self.close_if_idle();
    }
}
