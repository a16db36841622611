//! Test fixtures: documents, a recording listener and a scripted server.

use docwatch_engine::{
    ListenerRegistration, MockServer, MockServerStream, MockTransport, QuerySnapshot, WatchConfig,
    WatchEngine, WatchError, WatchResult,
};
use docwatch_protocol::{
    Bytes, DocumentKey, DocumentSnapshot, ListenRequest, QueryDescriptor, RawChange, Status,
    TargetId, Timestamp, Value,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long timed waits block before giving up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a document at `path` with the given top-level fields. `version`
/// becomes the update time in seconds.
pub fn doc<'a>(
    path: &str,
    fields: impl IntoIterator<Item = (&'a str, Value)>,
    version: i64,
) -> DocumentSnapshot {
    let key = DocumentKey::parse(path).expect("valid document path");
    DocumentSnapshot::new(
        key,
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        Timestamp::from_seconds(version),
    )
}

/// Builds a document without fields.
pub fn empty_doc(path: &str, version: i64) -> DocumentSnapshot {
    doc(path, std::iter::empty(), version)
}

/// Starts an engine on a fresh mock transport.
pub fn start_engine(config: WatchConfig) -> (WatchEngine, MockServer) {
    let (engine, _, server) = start_engine_with_transport(config);
    (engine, server)
}

/// Like [`start_engine`], also returning the transport for failure injection.
pub fn start_engine_with_transport(config: WatchConfig) -> (WatchEngine, Arc<MockTransport>, MockServer) {
    crate::init_tracing();
    let (transport, server) = MockTransport::new();
    let transport = Arc::new(transport);
    let engine = WatchEngine::start(config, transport.clone()).expect("tokio runtime");
    (engine, transport, server)
}

/// Something a [`RecordingListener`] observed.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A snapshot.
    Snapshot(QuerySnapshot),
    /// The terminal error.
    Error(WatchError),
}

/// Records listener callbacks into a channel the test can await.
#[derive(Debug)]
pub struct RecordingListener {
    sender: mpsc::UnboundedSender<ListenerEvent>,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingListener {
    /// Creates a recorder with no registrations.
    pub fn new() -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self { sender, events }
    }

    /// Registers a listener on `engine` that records into this recorder.
    pub fn listen(&self, engine: &WatchEngine, query: &QueryDescriptor) -> WatchResult<ListenerRegistration> {
        let snapshots = self.sender.clone();
        let errors = self.sender.clone();
        engine.listen(
            query,
            move |snapshot| {
                let _ = snapshots.send(ListenerEvent::Snapshot(snapshot.clone()));
            },
            move |error| {
                let _ = errors.send(ListenerEvent::Error(error.clone()));
            },
        )
    }

    /// Waits for the next event, or `None` after [`EVENT_TIMEOUT`].
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        timeout(EVENT_TIMEOUT, self.events.recv()).await.ok().flatten()
    }

    /// Waits for the next event and requires it to be a snapshot.
    pub async fn next_snapshot(&mut self) -> QuerySnapshot {
        match self.next_event().await {
            Some(ListenerEvent::Snapshot(snapshot)) => snapshot,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    /// Waits for the next event and requires it to be an error.
    pub async fn next_error(&mut self) -> WatchError {
        match self.next_event().await {
            Some(ListenerEvent::Error(error)) => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    /// Asserts that nothing arrives within `quiet`.
    pub async fn assert_quiet(&mut self, quiet: Duration) {
        if let Ok(Some(event)) = timeout(quiet, self.events.recv()).await {
            panic!("unexpected event {event:?}");
        }
    }

    /// Returns an already recorded event without waiting.
    pub fn try_next_event(&mut self) -> Option<ListenerEvent> {
        self.events.try_recv().ok()
    }
}

/// Waits for the engine to open a stream and wraps its server end.
pub async fn accept_stream(server: &mut MockServer) -> ScriptedStream {
    let stream = timeout(EVENT_TIMEOUT, server.next_stream())
        .await
        .expect("timed out waiting for a stream")
        .expect("transport dropped");
    ScriptedStream { stream }
}

/// Server end of one stream with helpers for the usual message shapes.
#[derive(Debug)]
pub struct ScriptedStream {
    stream: MockServerStream,
}

impl ScriptedStream {
    /// Waits for the next client request.
    pub async fn expect_request(&mut self) -> ListenRequest {
        timeout(EVENT_TIMEOUT, self.stream.next_request())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the stream")
    }

    /// Waits for an add request, returning the target id and resume token.
    pub async fn expect_add(&mut self) -> (TargetId, Option<Bytes>) {
        match self.expect_request().await {
            ListenRequest::AddTarget {
                target_id,
                resume_token,
                ..
            } => (target_id, resume_token),
            other => panic!("expected AddTarget, got {other:?}"),
        }
    }

    /// Waits for a remove request.
    pub async fn expect_remove(&mut self) -> TargetId {
        match self.expect_request().await {
            ListenRequest::RemoveTarget { target_id } => target_id,
            other => panic!("expected RemoveTarget, got {other:?}"),
        }
    }

    /// Asserts that the client sends nothing within `quiet`.
    pub async fn assert_no_request(&mut self, quiet: Duration) {
        if let Ok(Some(request)) = timeout(quiet, self.stream.next_request()).await {
            panic!("unexpected request {request:?}");
        }
    }

    /// Waits until the client drops the stream.
    pub async fn expect_closed(&mut self) {
        let closed = timeout(EVENT_TIMEOUT, async {
            while self.stream.next_request().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "stream still open");
    }

    /// Sends a raw message.
    pub fn send(&self, change: RawChange) {
        assert!(self.stream.send(change), "client closed the stream");
    }

    /// Acknowledges a target.
    pub fn added(&self, target_id: TargetId) {
        self.send(RawChange::TargetAdded { target_id });
    }

    /// Sends a document version for the given targets.
    pub fn upsert(&self, target_ids: &[TargetId], document: &DocumentSnapshot) {
        let data = document.encode().expect("encodable document");
        self.send(RawChange::DocumentChanged {
            key: document.key().clone(),
            data: Bytes::from(data),
            update_time: document.update_time(),
            target_ids: target_ids.to_vec(),
            removed_target_ids: Vec::new(),
        });
    }

    /// Removes a document from the given targets.
    pub fn delete(&self, target_ids: &[TargetId], path: &str) {
        self.send(RawChange::DocumentRemoved {
            key: DocumentKey::parse(path).expect("valid document path"),
            target_ids: target_ids.to_vec(),
        });
    }

    /// Marks a target consistent at `read_seconds`.
    pub fn consistent(&self, target_id: TargetId, token: &'static str, read_seconds: i64) {
        self.send(RawChange::TargetConsistent {
            target_id,
            resume_token: Bytes::from_static(token.as_bytes()),
            read_time: Timestamp::from_seconds(read_seconds),
        });
    }

    /// Tells the client to discard pending changes for a target.
    pub fn reset(&self, target_id: TargetId) {
        self.send(RawChange::TargetReset { target_id });
    }

    /// Sends an existence filter.
    pub fn existence_filter(&self, target_id: TargetId, expected_count: usize) {
        self.send(RawChange::ExistenceFilterMismatch {
            target_id,
            expected_count,
        });
    }

    /// Removes a target, optionally with an error status.
    pub fn remove_target(&self, target_id: TargetId, cause: Option<Status>) {
        self.send(RawChange::TargetRemoved { target_id, cause });
    }

    /// Fails the stream.
    pub fn fail(&self, error: WatchError) {
        let _ = self.stream.fail(error);
    }

    /// Whether the client dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}
