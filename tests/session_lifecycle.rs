//! Single-shard session lifecycle against the in-memory gateway

mod common;

use chat_gateway::shard::ShardStatus;
use chat_gateway::{
    ApInfo, Event, EventCategory, Intents, LifecycleEvent, LocalSessionManager, SessionManager,
    ShardExit,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn manager(connector: Arc<MockConnector>) -> LocalSessionManager {
    LocalSessionManager::new(gateway_info(1, 1))
        .with_connector(connector)
        .with_policy(test_policy())
}

fn dispatch_sequences(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(Event::as_dispatch)
        .filter_map(|d| d.sequence)
        .collect()
}

fn lifecycle(events: &[Event]) -> Vec<LifecycleEvent> {
    events.iter().filter_map(Event::as_lifecycle).cloned().collect()
}

#[tokio::test(start_paused = true)]
async fn test_resume_preserves_session_and_sequence() {
    let (connector, mut accepted) = MockConnector::accepting();
    let manager = manager(Arc::clone(&connector));
    let (handler, seen) = recorder();
    manager.register_handler(EventCategory::All, handler);
    manager
        .start(ApInfo::default(), token(), Intents::public_default())
        .await
        .unwrap();

    let mut conn = accepted.recv().await.unwrap();
    assert_eq!(conn.url, ENDPOINT);
    conn.hello(45_000);
    let identify = conn.expect_op(2).await;
    assert_eq!(identify["d"]["token"], "Bot 1024.s3cret");
    assert_eq!(identify["d"]["shard"], serde_json::json!([0, 1]));
    conn.ready("session-a", 1);
    conn.dispatch(2, "AT_MESSAGE_CREATE");
    conn.dispatch(3, "GUILD_CREATE");

    let state = manager.shard_state();
    wait_until(|| state.snapshot(0).and_then(|s| s.last_sequence) == Some(3)).await;

    // Recoverable close: the shard comes back and resumes
    conn.close(4009, "session timed out");
    let mut conn = accepted.recv().await.unwrap();
    conn.hello(45_000);
    let resume = conn.expect_op(6).await;
    assert_eq!(resume["d"]["session_id"], "session-a");
    assert_eq!(resume["d"]["seq"], 3);

    // Replay overlaps what the shard already has
    conn.dispatch(3, "GUILD_CREATE");
    conn.dispatch(4, "AT_MESSAGE_CREATE");
    conn.resumed();

    wait_until(|| state.get_status(0) == Some(ShardStatus::Ready) && connector.dials() == 2).await;
    wait_until(|| {
        lifecycle(&seen.lock().unwrap())
            .iter()
            .any(|l| matches!(l, LifecycleEvent::Resumed { .. }))
    })
    .await;

    let events = seen.lock().unwrap().clone();
    assert_eq!(dispatch_sequences(&events), vec![1, 2, 3, 4]);
    assert!(lifecycle(&events).contains(&LifecycleEvent::Resumed {
        shard_id: 0,
        session_id: "session-a".to_string(),
        sequence: 4,
    }));

    let snapshot = state.snapshot(0).unwrap();
    assert_eq!(snapshot.session_id.as_deref(), Some("session-a"));
    assert_eq!(snapshot.last_sequence, Some(4));

    manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_resume_falls_back_to_new_session() {
    let (connector, mut accepted) = MockConnector::accepting();
    let manager = manager(connector);
    let (handler, seen) = recorder();
    manager.register_handler(EventCategory::Lifecycle, handler);
    manager
        .start(ApInfo::default(), token(), Intents::public_default())
        .await
        .unwrap();

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(45_000);
    conn.expect_op(2).await;
    conn.ready("session-a", 1);
    conn.dispatch(2, "AT_MESSAGE_CREATE");
    conn.close(4009, "session timed out");

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(45_000);
    conn.expect_op(6).await;
    conn.invalid_session(false);

    // The refused connection is dropped and a new one identifies
    conn.closed_by_client().await;
    let mut conn = accepted.recv().await.unwrap();
    assert_eq!(conn.url, ENDPOINT);
    conn.hello(45_000);
    let identify = conn.expect_op(2).await;
    assert_eq!(identify["d"]["shard"], serde_json::json!([0, 1]));
    conn.ready("session-b", 1);

    let state = manager.shard_state();
    wait_until(|| {
        state.snapshot(0).and_then(|s| s.session_id) == Some("session-b".to_string())
    })
    .await;

    let readies = || -> Vec<String> {
        lifecycle(&seen.lock().unwrap())
            .into_iter()
            .filter_map(|l| match l {
                LifecycleEvent::Ready { session_id, .. } => Some(session_id),
                _ => None,
            })
            .collect()
    };
    wait_until(|| readies().len() == 2).await;
    assert_eq!(readies(), vec!["session-a", "session-b"]);
    assert!(lifecycle(&seen.lock().unwrap()).contains(&LifecycleEvent::Disconnected {
        shard_id: 0,
        resumable: false,
        reason: "session invalidated".to_string(),
    }));
    assert_eq!(state.get_status(0), Some(ShardStatus::Ready));

    manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeat_acks_reconnect_with_resume() {
    let (connector, mut accepted) = MockConnector::accepting();
    let manager = manager(connector);
    let (handler, seen) = recorder();
    manager.register_handler(EventCategory::Lifecycle, handler);
    manager
        .start(ApInfo::default(), token(), Intents::public_default())
        .await
        .unwrap();

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(1_000);
    conn.expect_op(2).await;
    conn.ready("session-a", 5);

    // Two heartbeats go out and neither is acknowledged
    let first = conn.next_payload().await.unwrap();
    assert_eq!(first["op"], 1);
    assert_eq!(first["d"], 5);
    let second = conn.next_payload().await.unwrap();
    assert_eq!(second["op"], 1);
    // The next tick declares the connection stale and drops it
    assert!(conn.next_payload().await.is_none());

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(1_000);
    let resume = conn.expect_op(6).await;
    assert_eq!(resume["d"]["session_id"], "session-a");
    assert_eq!(resume["d"]["seq"], 5);

    wait_until(|| {
        lifecycle(&seen.lock().unwrap()).iter().any(|l| {
            matches!(
                l,
                LifecycleEvent::Disconnected {
                    resumable: true,
                    ..
                }
            )
        })
    })
    .await;

    manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_auth_closes_without_reconnect() {
    let (connector, mut accepted) = MockConnector::accepting();
    let manager = manager(Arc::clone(&connector));
    let (handler, seen) = recorder();
    manager.register_handler(EventCategory::Lifecycle, handler);
    manager
        .start(ApInfo::default(), token(), Intents::public_default())
        .await
        .unwrap();

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(45_000);
    conn.expect_op(2).await;
    conn.close(4004, "authentication failed");

    let state = manager.shard_state();
    wait_until(|| state.get_status(0) == Some(ShardStatus::Closing)).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(connector.dials(), 1);
    assert_eq!(state.get_status(0), Some(ShardStatus::Closing));
    assert!(!manager.is_running().await);

    let events = seen.lock().unwrap().clone();
    assert_eq!(
        lifecycle(&events).last(),
        Some(&LifecycleEvent::Closed {
            shard_id: 0,
            exit: ShardExit::FatalAuth {
                code: 4004,
                reason: "authentication failed".to_string(),
            },
        })
    );

    manager.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_does_not_kill_session() {
    let (connector, mut accepted) = MockConnector::accepting();
    let manager = manager(Arc::clone(&connector));
    let (handler, seen) = recorder();
    manager.register_handler(EventCategory::AtMessage, handler);
    manager
        .start(ApInfo::default(), token(), Intents::public_default())
        .await
        .unwrap();

    let mut conn = accepted.recv().await.unwrap();
    conn.hello(45_000);
    conn.expect_op(2).await;
    conn.ready("session-a", 1);
    conn.dispatch(2, "AT_MESSAGE_CREATE");
    conn.send_raw("{\"op\":0,\"s\":");
    conn.dispatch(3, "AT_MESSAGE_CREATE");

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(dispatch_sequences(&seen.lock().unwrap()), vec![2, 3]);
    assert_eq!(connector.dials(), 1);

    manager.stop().await.unwrap();
}
