//! Restarting a queue manager on the same storage.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use common::{SOON, fast_config, free_port, queue, receive_soon, start_with};
use quay_core::{Destination, Endpoint, MessagePayload};
use quay_manager::DeliveryEvent;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outgoing_survives_restart_and_is_delivered() {
    let storage = tempfile::tempdir().unwrap();
    let port = free_port();
    let destination = Destination::new(Endpoint::new("127.0.0.1", port), queue("h"));

    let sender = start_with(fast_config("sender").with_storage_path(storage.path())).await;
    let mut events = sender.subscribe_events();
    let id = sender
        .send(&destination, MessagePayload::new(b"durable".to_vec()))
        .unwrap();
    let event = tokio::time::timeout(SOON, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, DeliveryEvent::Retrying { .. }));
    sender.stop().await.unwrap();
    drop(sender);

    let sender = start_with(fast_config("sender").with_storage_path(storage.path())).await;
    let pending = sender.pending_outgoing().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.id, id);

    let receiver = start_with(fast_config("receiver").with_port(port)).await;
    let received = receive_soon(&receiver, &queue("h")).await;
    assert_eq!(received.message.id, id);
    assert_eq!(received.message.data, b"durable");
    received.scope.commit().unwrap();

    assert!(sender.wait_for_all_sent(SOON).await.unwrap());

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reserved_message_reappears_after_restart() {
    let storage = tempfile::tempdir().unwrap();
    let config = fast_config("receiver").with_storage_path(storage.path());

    let manager = start_with(config.clone()).await;
    let id = manager
        .enqueue_local(&queue("h"), MessagePayload::new(vec![1]))
        .unwrap();
    let received = receive_soon(&manager, &queue("h")).await;
    assert_eq!(received.message.id, id);
    assert!(manager.peek(&queue("h")).unwrap().is_empty());

    // Never committed: stop rolls the scope back once the timeout lapses.
    manager.stop().await.unwrap();
    drop(received);
    drop(manager);

    let manager = start_with(config).await;
    let peeked = manager.peek(&queue("h")).unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].id, id);

    let again = receive_soon(&manager, &queue("h")).await;
    assert_eq!(again.message.id, id);
    again.scope.commit().unwrap();
    assert!(
        manager
            .receive(&queue("h"), Duration::from_millis(200))
            .await
            .unwrap()
            .is_none()
    );

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumed_message_stays_consumed_after_restart() {
    let storage = tempfile::tempdir().unwrap();
    let config = fast_config("receiver").with_storage_path(storage.path());

    let manager = start_with(config.clone()).await;
    manager
        .enqueue_local(&queue("h"), MessagePayload::new(vec![1]))
        .unwrap();
    manager
        .enqueue_local(&queue("h"), MessagePayload::new(vec![2]))
        .unwrap();
    let received = receive_soon(&manager, &queue("h")).await;
    received.scope.commit().unwrap();
    manager.stop().await.unwrap();
    drop(manager);

    let manager = start_with(config).await;
    let remaining = manager.peek(&queue("h")).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, received.message.id);
    manager.stop().await.unwrap();
}
