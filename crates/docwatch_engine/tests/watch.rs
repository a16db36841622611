//! End-to-end tests for the watch engine over the mock transport.

use docwatch_engine::{BackoffConfig, ChangeType, StreamState, WatchConfig, WatchEngine, WatchError};
use docwatch_protocol::{
    Bytes, Direction, DocumentKey, QueryDescriptor, RawChange, Status, StatusCode, TargetId,
    Timestamp, Value,
};
use docwatch_testkit::{accept_stream, doc, empty_doc, start_engine, start_engine_with_transport, RecordingListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(50);

fn fast_config() -> WatchConfig {
    WatchConfig::default().with_backoff(BackoffConfig::new(
        Duration::from_millis(10),
        Duration::from_millis(50),
    ))
}

fn items() -> QueryDescriptor {
    QueryDescriptor::collection("items")
}

fn by_score() -> QueryDescriptor {
    QueryDescriptor::collection("items").order_by("score", Direction::Descending)
}

fn changes(snapshot: &docwatch_engine::QuerySnapshot) -> Vec<(ChangeType, String, Option<usize>, Option<usize>)> {
    snapshot
        .changes()
        .iter()
        .map(|c| {
            (
                c.change_type(),
                c.document().id().to_string(),
                c.old_index(),
                c.new_index(),
            )
        })
        .collect()
}

#[tokio::test]
async fn nothing_delivered_before_consistency_marker() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &by_score()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, token) = stream.expect_add().await;
    assert!(token.is_none());

    stream.added(target);
    stream.upsert(&[target], &doc("items/a", [("score", Value::Integer(1))], 1));
    stream.upsert(&[target], &doc("items/b", [("score", Value::Integer(5))], 1));
    recorder.assert_quiet(QUIET).await;

    stream.consistent(target, "t1", 10);
    let snapshot = recorder.next_snapshot().await;
    assert_eq!(snapshot.ids(), vec!["b", "a"]);
    assert_eq!(snapshot.read_time(), Timestamp::from_seconds(10));
    assert!(!snapshot.is_from_cache());
    assert_eq!(
        changes(&snapshot),
        vec![
            (ChangeType::Added, "b".to_string(), None, Some(0)),
            (ChangeType::Added, "a".to_string(), None, Some(1)),
        ]
    );
    assert_eq!(engine.stream_state(), StreamState::Streaming);
}

#[tokio::test]
async fn deltas_carry_moves_and_removals() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &by_score()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    for (id, score) in [("a", 3), ("b", 2), ("c", 1)] {
        stream.upsert(&[target], &doc(&format!("items/{id}"), [("score", Value::Integer(score))], 1));
    }
    stream.consistent(target, "t1", 1);
    assert_eq!(recorder.next_snapshot().await.ids(), vec!["a", "b", "c"]);

    stream.upsert(&[target], &doc("items/c", [("score", Value::Integer(9))], 2));
    stream.delete(&[target], "items/b");
    stream.consistent(target, "t2", 2);

    let snapshot = recorder.next_snapshot().await;
    assert_eq!(snapshot.ids(), vec!["c", "a"]);
    assert_eq!(
        changes(&snapshot),
        vec![
            (ChangeType::Removed, "b".to_string(), Some(1), None),
            (ChangeType::Modified, "c".to_string(), Some(1), Some(0)),
        ]
    );

    // same content, new marker: no snapshot
    stream.upsert(&[target], &doc("items/a", [("score", Value::Integer(3))], 1));
    stream.consistent(target, "t3", 3);
    recorder.assert_quiet(QUIET).await;
}

#[tokio::test]
async fn late_joiner_receives_complete_first_snapshot() {
    let (engine, mut server) = start_engine(fast_config());
    let mut first = RecordingListener::new();
    first.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/x", 1));
    stream.upsert(&[target], &empty_doc("items/y", 1));
    stream.consistent(target, "t1", 1);
    first.next_snapshot().await;

    let mut late = RecordingListener::new();
    let registration = late.listen(&engine, &items()).unwrap();
    assert_eq!(registration.target_id(), target);

    let snapshot = late.next_snapshot().await;
    assert_eq!(snapshot.ids(), vec!["x", "y"]);
    assert_eq!(
        changes(&snapshot),
        vec![
            (ChangeType::Added, "x".to_string(), None, Some(0)),
            (ChangeType::Added, "y".to_string(), None, Some(1)),
        ]
    );
    first.assert_quiet(QUIET).await;
    assert!(!stream.is_closed());
    assert_eq!(engine.stats().active_targets, 1);

    // both see the next delta
    stream.delete(&[target], "items/x");
    stream.consistent(target, "t2", 2);
    assert_eq!(first.next_snapshot().await.ids(), vec!["y"]);
    assert_eq!(late.next_snapshot().await.ids(), vec!["y"]);
}

#[tokio::test]
async fn panicking_listener_does_not_starve_others() {
    let (engine, mut server) = start_engine(fast_config());
    engine
        .listen(&items(), |_| panic!("listener bug"), |_| {})
        .unwrap();
    let mut healthy = RecordingListener::new();
    healthy.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/a", 1));
    stream.consistent(target, "t1", 1);
    assert_eq!(healthy.next_snapshot().await.ids(), vec!["a"]);

    stream.delete(&[target], "items/a");
    stream.consistent(target, "t2", 2);
    assert!(healthy.next_snapshot().await.is_empty());
}

#[tokio::test]
async fn reset_diffs_against_last_snapshot() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/a", 1));
    stream.upsert(&[target], &empty_doc("items/b", 1));
    stream.consistent(target, "t1", 1);
    recorder.next_snapshot().await;

    stream.upsert(&[target], &empty_doc("items/z", 2));
    stream.reset(target);
    stream.upsert(&[target], &empty_doc("items/b", 1));
    stream.upsert(&[target], &empty_doc("items/c", 2));
    stream.consistent(target, "t2", 2);

    let snapshot = recorder.next_snapshot().await;
    assert_eq!(snapshot.ids(), vec!["b", "c"]);
    assert_eq!(
        changes(&snapshot),
        vec![
            (ChangeType::Removed, "a".to_string(), Some(0), None),
            (ChangeType::Added, "c".to_string(), None, Some(1)),
        ]
    );
    assert_eq!(engine.stats().resets, 1);
}

#[tokio::test]
async fn existence_filter_mismatch_resyncs_without_token() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/a", 1));
    stream.upsert(&[target], &empty_doc("items/b", 1));
    stream.consistent(target, "t1", 1);
    recorder.next_snapshot().await;

    // matching count is a no-op
    stream.existence_filter(target, 2);
    stream.existence_filter(target, 1);
    assert_eq!(stream.expect_remove().await, target);
    let (readded, token) = stream.expect_add().await;
    assert_eq!(readded, target);
    assert!(token.is_none());

    stream.remove_target(target, None);
    stream.added(target);
    stream.upsert(&[target], &empty_doc("items/b", 1));
    stream.consistent(target, "t2", 2);

    let snapshot = recorder.next_snapshot().await;
    assert_eq!(snapshot.ids(), vec!["b"]);
    assert_eq!(
        changes(&snapshot),
        vec![(ChangeType::Removed, "a".to_string(), Some(0), None)]
    );
    assert_eq!(engine.stats().resets, 1);
}

#[tokio::test]
async fn repeated_existence_mismatch_fails_target() {
    let config = fast_config().with_max_consecutive_resets(1);
    let (engine, mut server) = start_engine(config);
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.consistent(target, "t1", 1);
    recorder.next_snapshot().await;

    stream.existence_filter(target, 3);
    stream.expect_remove().await;
    stream.expect_add().await;
    stream.existence_filter(target, 3);

    match recorder.next_error().await {
        WatchError::ExistenceFilterMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, 3);
            assert_eq!(actual, 0);
        }
        other => panic!("unexpected error {other}"),
    }
    stream.expect_remove().await;
    stream.expect_closed().await;
}

#[tokio::test]
async fn reconnect_resumes_from_token() {
    let (engine, transport, mut server) = start_engine_with_transport(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/a", 1));
    stream.consistent(target, "resume-here", 1);
    recorder.next_snapshot().await;

    stream.fail(WatchError::Stream(Status::new(StatusCode::Unavailable, "server restart")));
    let mut stream = accept_stream(&mut server).await;
    let (readded, token) = stream.expect_add().await;
    assert_eq!(readded, target);
    assert_eq!(token, Some(Bytes::from_static(b"resume-here")));

    // the server resumes; an unchanged marker produces nothing
    stream.consistent(target, "t2", 2);
    recorder.assert_quiet(QUIET).await;

    stream.upsert(&[target], &empty_doc("items/b", 3));
    stream.consistent(target, "t3", 3);
    assert_eq!(recorder.next_snapshot().await.ids(), vec!["a", "b"]);

    let stats = engine.stats();
    assert_eq!(stats.streams_opened, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn failed_opens_back_off_and_retry() {
    let (engine, transport, mut server) = start_engine_with_transport(fast_config());
    transport.fail_next_open(WatchError::transport_retryable("offline"));
    transport.fail_next_open(WatchError::transport_retryable("still offline"));

    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    stream.expect_add().await;
    assert_eq!(transport.open_count(), 3);
    assert_eq!(engine.stats().reconnects, 2);
    recorder.assert_quiet(QUIET).await;
}

#[tokio::test]
async fn permanent_stream_error_terminates_listeners() {
    let (engine, mut server) = start_engine(fast_config());
    let mut a = RecordingListener::new();
    let mut b = RecordingListener::new();
    a.listen(&engine, &items()).unwrap();
    b.listen(&engine, &by_score()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    stream.expect_add().await;
    stream.expect_add().await;

    let status = Status::new(StatusCode::PermissionDenied, "revoked");
    stream.fail(WatchError::Stream(status.clone()));

    assert_eq!(a.next_error().await, WatchError::Stream(status.clone()));
    assert_eq!(b.next_error().await, WatchError::Stream(status));
    a.assert_quiet(QUIET).await;
    assert_eq!(engine.stats().active_targets, 0);
}

#[tokio::test]
async fn rejected_target_fails_only_its_listeners() {
    let (engine, mut server) = start_engine(fast_config());
    let mut rejected = RecordingListener::new();
    let mut fine = RecordingListener::new();
    rejected.listen(&engine, &by_score()).unwrap();
    fine.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (first, _) = stream.expect_add().await;
    let (second, _) = stream.expect_add().await;

    let status = Status::new(StatusCode::PermissionDenied, "no access");
    stream.remove_target(first, Some(status.clone()));
    assert_eq!(
        rejected.next_error().await,
        WatchError::TargetRejected {
            target_id: first,
            status
        }
    );

    stream.consistent(second, "t1", 1);
    assert!(fine.next_snapshot().await.is_empty());
    assert_eq!(engine.stats().active_targets, 1);
}

#[tokio::test]
async fn undecodable_document_fails_addressed_targets() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.send(RawChange::DocumentChanged {
        key: DocumentKey::parse("items/a").unwrap(),
        data: Bytes::from_static(&[0xff, 0x00]),
        update_time: Timestamp::from_seconds(1),
        target_ids: vec![target],
        removed_target_ids: Vec::new(),
    });

    assert!(matches!(recorder.next_error().await, WatchError::Protocol(_)));
    assert_eq!(stream.expect_remove().await, target);
}

#[tokio::test]
async fn last_listener_removal_closes_stream() {
    let (engine, mut server) = start_engine(fast_config());
    let recorder = RecordingListener::new();
    let first = recorder.listen(&engine, &items()).unwrap();
    let second = recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;

    first.remove();
    assert_eq!(engine.stats().active_listeners, 1);
    second.remove();
    second.remove();

    assert_eq!(stream.expect_remove().await, target);
    stream.expect_closed().await;
    assert_eq!(engine.stats().active_targets, 0);

    // a new listen opens a fresh stream with a new target
    recorder.listen(&engine, &items()).unwrap();
    let mut stream = accept_stream(&mut server).await;
    let (fresh, _) = stream.expect_add().await;
    assert_ne!(fresh, target);
}

#[tokio::test]
async fn listener_can_remove_itself_from_callback() {
    let (engine, mut server) = start_engine(fast_config());
    let slot: Arc<Mutex<Option<docwatch_engine::ListenerRegistration>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(0usize));

    let registration = {
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        engine
            .listen(
                &items(),
                move |_| {
                    *seen.lock().unwrap() += 1;
                    if let Some(registration) = slot.lock().unwrap().take() {
                        registration.remove();
                    }
                },
                |_| {},
            )
            .unwrap()
    };
    *slot.lock().unwrap() = Some(registration.clone());

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.consistent(target, "t1", 1);

    assert_eq!(stream.expect_remove().await, target);
    assert!(!registration.is_active());
    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(engine.stats().active_listeners, 0);
}

#[tokio::test]
async fn forced_shutdown_delivers_one_terminal_error() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    let registration = recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    stream.expect_add().await;

    assert_eq!(
        engine.shutdown(true),
        Err(WatchError::StillListening { active: 1 })
    );
    engine.shutdown(false).unwrap();
    engine.shutdown(false).unwrap();

    assert_eq!(recorder.next_error().await, WatchError::Cancelled);
    recorder.assert_quiet(QUIET).await;
    assert!(!registration.is_active());

    engine.closed().await;
    stream.expect_closed().await;
    assert_eq!(engine.stream_state(), StreamState::Stopped);
    assert!(matches!(
        engine.listen(&items(), |_| {}, |_| {}),
        Err(WatchError::ShutdownInProgress)
    ));
}

#[tokio::test]
async fn messages_for_unknown_targets_are_ignored() {
    let (engine, mut server) = start_engine(fast_config());
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    let stranger = TargetId::new(target.get() + 100);
    stream.upsert(&[stranger], &empty_doc("items/a", 1));
    stream.consistent(stranger, "x", 1);
    stream.consistent(target, "t1", 1);

    assert!(recorder.next_snapshot().await.is_empty());
    drop(engine);
}

#[tokio::test]
async fn queued_listens_add_each_target_once() {
    let (engine, mut server) = start_engine(fast_config());
    let recorder = RecordingListener::new();
    let first = recorder.listen(&engine, &items()).unwrap();
    let second = recorder.listen(&engine, &by_score()).unwrap();
    assert_ne!(first.target_id(), second.target_id());

    let mut stream = accept_stream(&mut server).await;
    let (a, _) = stream.expect_add().await;
    let (b, _) = stream.expect_add().await;
    let mut added = vec![a, b];
    added.sort_by_key(|id| id.get());
    let mut expected = vec![first.target_id(), second.target_id()];
    expected.sort_by_key(|id| id.get());
    assert_eq!(added, expected);

    stream.assert_no_request(QUIET).await;
    assert_eq!(engine.stats().streams_opened, 1);
}

#[tokio::test]
async fn self_removal_does_not_disturb_sibling_delivery() {
    let (engine, mut server) = start_engine(fast_config());
    let slot: Arc<Mutex<Option<docwatch_engine::ListenerRegistration>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(0usize));

    let remover = {
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        engine
            .listen(
                &items(),
                move |_| {
                    *seen.lock().unwrap() += 1;
                    if let Some(registration) = slot.lock().unwrap().take() {
                        registration.remove();
                    }
                },
                |_| {},
            )
            .unwrap()
    };
    *slot.lock().unwrap() = Some(remover.clone());
    let mut sibling = RecordingListener::new();
    sibling.listen(&engine, &items()).unwrap();

    let mut stream = accept_stream(&mut server).await;
    let (target, _) = stream.expect_add().await;
    stream.upsert(&[target], &empty_doc("items/a", 1));
    stream.consistent(target, "t1", 1);

    assert_eq!(sibling.next_snapshot().await.ids(), vec!["a"]);
    sibling.assert_quiet(QUIET).await;
    assert!(!remover.is_active());

    // the target survives on the sibling alone
    stream.delete(&[target], "items/a");
    stream.consistent(target, "t2", 2);
    assert!(sibling.next_snapshot().await.is_empty());
    assert_eq!(*seen.lock().unwrap(), 1);
    stream.assert_no_request(QUIET).await;
    assert_eq!(engine.stats().active_listeners, 1);
}

fn slow_retry_config(initial: Duration) -> WatchConfig {
    WatchConfig::default().with_backoff(BackoffConfig::new(initial, initial).with_jitter_factor(0.0))
}

async fn wait_for_opens(transport: &docwatch_engine::MockTransport, count: usize) {
    let reached = tokio::time::timeout(docwatch_testkit::EVENT_TIMEOUT, async {
        while transport.open_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "only {} opens", transport.open_count());
}

#[tokio::test]
async fn shutdown_cancels_pending_reconnect() {
    let retry = Duration::from_millis(300);
    let (engine, transport, mut server) = start_engine_with_transport(slow_retry_config(retry));
    let mut recorder = RecordingListener::new();
    recorder.listen(&engine, &items()).unwrap();

    let stream = accept_stream(&mut server).await;
    transport.fail_next_open(WatchError::transport_retryable("offline"));
    stream.fail(WatchError::transport_retryable("connection reset"));
    wait_for_opens(&transport, 2).await;

    engine.shutdown(false).unwrap();
    assert_eq!(recorder.next_error().await, WatchError::Cancelled);
    engine.closed().await;

    tokio::time::sleep(retry + Duration::from_millis(200)).await;
    assert_eq!(transport.open_count(), 2);
    assert!(server.try_next_stream().is_none());
    assert_eq!(engine.stream_state(), StreamState::Stopped);
}

#[tokio::test]
async fn removing_last_listener_clears_pending_reconnect() {
    let (engine, transport, mut server) =
        start_engine_with_transport(slow_retry_config(Duration::from_secs(30)));
    let recorder = RecordingListener::new();
    let registration = recorder.listen(&engine, &items()).unwrap();

    let stream = accept_stream(&mut server).await;
    transport.fail_next_open(WatchError::transport_retryable("offline"));
    stream.fail(WatchError::transport_retryable("connection reset"));
    wait_for_opens(&transport, 2).await;

    registration.remove();
    assert_eq!(engine.stats().active_targets, 0);

    // with the timer gone a new listen connects right away
    recorder.listen(&engine, &items()).unwrap();
    let mut stream = accept_stream(&mut server).await;
    let (fresh, token) = stream.expect_add().await;
    assert_ne!(fresh, registration.target_id());
    assert!(token.is_none());
    assert_eq!(transport.open_count(), 3);
}
