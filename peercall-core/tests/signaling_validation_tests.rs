//! Signaling validation and edge case tests

use peercall_core::{
    CallConfig, CallController, CallEvent, CallMode, CallSessionManager, CallState, DocumentStore,
    EndReason, Identity, LoopbackTransport, MemoryStore, SessionDescription, SessionId,
    SessionPatch, SignalingChannel, SignalingConfig, SimulatedCamera,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn signaling(store: &Arc<MemoryStore>) -> Arc<SignalingChannel> {
    let config = SignalingConfig {
        retry_backoff_ms: 1,
        ..SignalingConfig::default()
    };
    Arc::new(SignalingChannel::new(store.clone(), config))
}

async fn manager(
    store: &Arc<MemoryStore>,
    id: &str,
) -> (CallController, broadcast::Receiver<CallEvent>) {
    let calls = CallSessionManager::start(
        Identity::new(id, id.to_uppercase()),
        CallConfig::default(),
        signaling(store),
        Arc::new(LoopbackTransport::new()),
        Arc::new(SimulatedCamera::labeled(id)),
    )
    .await
    .unwrap();
    let events = calls.subscribe_events();
    (calls, events)
}

async fn ended(events: &mut broadcast::Receiver<CallEvent>) -> EndReason {
    timeout(Duration::from_secs(5), async {
        loop {
            if let CallEvent::CallEnded { reason, .. } = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .unwrap()
}

/// Place a call to a callee that never shows up
async fn pending_call(store: &Arc<MemoryStore>) -> (CallController, broadcast::Receiver<CallEvent>, SessionId) {
    let (calls, events) = manager(store, "a1").await;
    let id = calls
        .initiate(Identity::new("b1", "Bob"), CallMode::Audio)
        .await
        .unwrap();
    (calls, events, id)
}

#[tokio::test]
async fn empty_answer_fails_caller() {
    let store = Arc::new(MemoryStore::new());
    let (calls, mut events, id) = pending_call(&store).await;

    signaling(&store)
        .update_session(&id, &SessionPatch::answer(SessionDescription::answer("")))
        .await
        .unwrap();

    assert!(matches!(ended(&mut events).await, EndReason::NegotiationFailed(_)));
    assert_eq!(calls.state(), CallState::Idle);
    assert!(store.get("calls", id.as_str()).is_none());
}

#[tokio::test]
async fn offer_in_answer_slot_fails_caller() {
    let store = Arc::new(MemoryStore::new());
    let (calls, mut events, id) = pending_call(&store).await;

    let patch = SessionPatch {
        answer: Some(SessionDescription::offer("v=0\r\n")),
        ..SessionPatch::default()
    };
    signaling(&store).update_session(&id, &patch).await.unwrap();

    match ended(&mut events).await {
        EndReason::NegotiationFailed(msg) => assert!(msg.contains("Expected")),
        other => panic!("unexpected end reason: {other:?}"),
    }
    assert_eq!(calls.state(), CallState::Idle);
}

#[tokio::test]
async fn malformed_answer_fails_caller() {
    let store = Arc::new(MemoryStore::new());
    let (_calls, mut events, id) = pending_call(&store).await;

    signaling(&store)
        .update_session(
            &id,
            &SessionPatch::answer(SessionDescription::answer("not-an-sdp")),
        )
        .await
        .unwrap();

    assert!(matches!(ended(&mut events).await, EndReason::NegotiationFailed(_)));
    sleep(Duration::from_millis(20)).await;
    assert_eq!(store.total_documents(), 0);
}

#[tokio::test]
async fn undecodable_records_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let (bob, _bob_events) = manager(&store, "b1").await;
    let (alice, _alice_events) = manager(&store, "a1").await;

    store
        .add("calls", json!({ "callerId": 42, "bogus": true }))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(bob.state(), CallState::Idle);

    // A well-formed call still goes through
    let id = alice
        .initiate(Identity::new("b1", "Bob"), CallMode::Audio)
        .await
        .unwrap();
    store
        .add(&format!("calls/{id}/callerCandidates"), json!({ "foo": 1 }))
        .await
        .unwrap();

    let mut state = bob.watch_state();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == CallState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn answered_record_is_not_treated_as_incoming() {
    let store = Arc::new(MemoryStore::new());
    let (bob, mut bob_events) = manager(&store, "b1").await;

    let record = json!({
        "offer": { "kind": "offer", "sdp": "v=0\r\n" },
        "answer": { "kind": "answer", "sdp": "v=0\r\n" },
        "callerId": "a1",
        "callerName": "Alice",
        "callerAvatar": "",
        "calleeId": "b1",
        "mode": "audio",
        "createdAt": "2024-01-01T00:00:00Z"
    });
    store.add("calls", record).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(bob.state(), CallState::Idle);
    assert!(matches!(
        bob_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}
