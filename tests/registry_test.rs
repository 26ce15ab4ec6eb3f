//! Tests for the connection registry: fan-out, idempotent cleanup, and
//! self-healing removal of dead connections.

use serde_json::json;
use tokio::sync::mpsc;

use duel_relay::registry::{ConnectionRegistry, ConnectionSender};
use duel_relay::ws::protocol::ServerMessage;

type FrameReceiver = mpsc::UnboundedReceiver<axum::extract::ws::Message>;

fn connection() -> (ConnectionSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

fn notification() -> ServerMessage {
    ServerMessage::Notification {
        data: json!({"n": 1}),
    }
}

fn drain(rx: &mut FrameReceiver) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn send_to_identity_reaches_every_connection() {
    let registry = ConnectionRegistry::new();
    let (tx1, mut rx1) = connection();
    let (tx2, mut rx2) = connection();

    registry.register_notification("U1", tx1);
    registry.register_notification("U1", tx2);

    let sent = registry.send_to_identity("U1", &notification());
    assert_eq!(sent, 2);
    assert_eq!(drain(&mut rx1), 1);
    assert_eq!(drain(&mut rx2), 1);

    // Unknown identity is not an error
    assert_eq!(registry.send_to_identity("nobody", &notification()), 0);
}

#[tokio::test]
async fn identity_key_removed_after_last_unregister() {
    let registry = ConnectionRegistry::new();
    let (tx1, _rx1) = connection();
    let (tx2, mut rx2) = connection();

    registry.register_notification("U1", tx1.clone());
    registry.register_notification("U1", tx2.clone());

    registry.unregister_notification("U1", &tx1);
    assert!(registry.has_identity("U1"));
    assert_eq!(registry.send_to_identity("U1", &notification()), 1);
    assert_eq!(drain(&mut rx2), 1);

    registry.unregister_notification("U1", &tx2);
    assert!(!registry.has_identity("U1"));
    assert_eq!(registry.send_to_identity("U1", &notification()), 0);
}

#[tokio::test]
async fn unregister_twice_is_noop() {
    let registry = ConnectionRegistry::new();
    let (tx1, _rx1) = connection();
    let (tx2, _rx2) = connection();

    registry.register_notification("U1", tx1.clone());
    registry.register_notification("U1", tx2);

    registry.unregister_notification("U1", &tx1);
    registry.unregister_notification("U1", &tx1);

    assert_eq!(registry.connection_count(), 1);
    assert!(registry.has_identity("U1"));
}

#[tokio::test]
async fn dead_connections_pruned_on_send() {
    let registry = ConnectionRegistry::new();
    let (tx1, rx1) = connection();
    let (tx2, mut rx2) = connection();

    registry.register_notification("U1", tx1);
    registry.register_notification("U1", tx2);

    // Simulate an abruptly dead connection: its receiver is gone
    drop(rx1);

    let sent = registry.send_to_identity("U1", &notification());
    assert_eq!(sent, 1);
    assert_eq!(drain(&mut rx2), 1);
    assert_eq!(registry.connection_count(), 1);
}

#[tokio::test]
async fn all_dead_connections_removes_identity() {
    let registry = ConnectionRegistry::new();
    let (tx1, rx1) = connection();

    registry.register_notification("U1", tx1);
    drop(rx1);

    assert_eq!(registry.send_to_identity("U1", &notification()), 0);
    assert!(!registry.has_identity("U1"));
}

#[tokio::test]
async fn room_last_connection_wins_per_participant() {
    let registry = ConnectionRegistry::new();
    let (old_tx, mut old_rx) = connection();
    let (new_tx, mut new_rx) = connection();

    registry.register_room("D1", "U1", old_tx);
    registry.register_room("D1", "U1", new_tx);

    let sent = registry.broadcast_to_room("D1", &notification());
    assert_eq!(sent, 1);
    assert_eq!(drain(&mut old_rx), 0);
    assert_eq!(drain(&mut new_rx), 1);
}

#[tokio::test]
async fn unregister_room_ignores_replaced_connection() {
    let registry = ConnectionRegistry::new();
    let (old_tx, _old_rx) = connection();
    let (new_tx, mut new_rx) = connection();

    registry.register_room("D1", "U1", old_tx.clone());
    registry.register_room("D1", "U1", new_tx);

    // The replaced actor's cleanup must not evict the replacement
    registry.unregister_room("D1", "U1", &old_tx);

    assert_eq!(registry.room_participants("D1"), vec!["U1".to_string()]);
    assert_eq!(registry.broadcast_to_room("D1", &notification()), 1);
    assert_eq!(drain(&mut new_rx), 1);
}

#[tokio::test]
async fn empty_room_is_removed() {
    let registry = ConnectionRegistry::new();
    let (tx, _rx) = connection();

    registry.register_room("D1", "U1", tx.clone());
    assert_eq!(registry.room_count(), 1);

    registry.unregister_room("D1", "U1", &tx);
    registry.unregister_room("D1", "U1", &tx); // idempotent

    assert_eq!(registry.room_count(), 0);
    assert_eq!(registry.broadcast_to_room("D1", &notification()), 0);
}

#[tokio::test]
async fn broadcast_racing_unregister_never_hits_removed_participant() {
    let registry = ConnectionRegistry::new();
    let (tx1, mut rx1) = connection();
    let (tx2, mut rx2) = connection();

    registry.register_room("D1", "U1", tx1);
    registry.register_room("D1", "U2", tx2.clone());

    // Hammer broadcasts from another task while U2 is torn down
    let broadcaster = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                registry.broadcast_to_room("D1", &ServerMessage::Status { data: json!({}) });
                tokio::task::yield_now().await;
            }
        })
    };

    registry.unregister_room("D1", "U2", &tx2);
    broadcaster.await.unwrap();

    // Frames sent before the unregister completed are fine; none may
    // arrive afterwards.
    drain(&mut rx2);
    registry.broadcast_to_room("D1", &ServerMessage::Status { data: json!({}) });
    assert_eq!(drain(&mut rx2), 0);
    assert!(drain(&mut rx1) > 0);
}
