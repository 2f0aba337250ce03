//! Transactional scope and ambient transaction behaviour.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{queue, receive_soon, start};
use quay_core::{Error, MessagePayload, Result};
use quay_manager::{AmbientTransaction, ScopeState, TransactionParticipant};

/// Stand-in for an unrelated resource such as a database write.
#[derive(Default)]
struct RecordingParticipant {
    veto: AtomicBool,
    prepared: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

#[async_trait]
impl TransactionParticipant for RecordingParticipant {
    fn name(&self) -> String {
        "database".to_string()
    }

    async fn prepare(&self) -> Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        if self.veto.load(Ordering::SeqCst) {
            return Err(Error::storage("insert", "constraint violated"));
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const QUIET: Duration = Duration::from_millis(300);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rolled_back_scope_sends_nothing() {
    let receiver = start("receiver").await;
    let sender = start("sender").await;
    let destination = receiver.destination("h").unwrap();

    let scope = sender.begin_scope().unwrap();
    for n in 0..5u8 {
        scope.send(&destination, MessagePayload::new(vec![n])).unwrap();
    }
    scope.rollback().unwrap();
    assert_eq!(scope.state().unwrap(), ScopeState::RolledBack);

    let dropped = sender.begin_scope().unwrap();
    dropped.send(&destination, MessagePayload::new(vec![9])).unwrap();
    drop(dropped);

    assert!(sender.pending_outgoing().unwrap().is_empty());
    assert!(receiver.receive(&queue("h"), QUIET).await.unwrap().is_none());

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finalized_scope_rejects_further_use() {
    let manager = start("local").await;
    let destination = manager.destination("h").unwrap();

    let scope = manager.begin_scope().unwrap();
    scope.commit().unwrap();
    assert!(matches!(scope.commit(), Err(Error::ScopeMisuse { .. })));
    assert!(matches!(scope.rollback(), Err(Error::ScopeMisuse { .. })));
    assert!(matches!(
        scope.send(&destination, MessagePayload::new(vec![1])),
        Err(Error::ScopeMisuse { .. })
    ));

    let scope = manager.begin_scope().unwrap();
    scope.rollback().unwrap();
    assert!(matches!(scope.commit(), Err(Error::ScopeMisuse { .. })));

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receive_and_forward_are_atomic() {
    let origin = start("origin").await;
    let next_hop = start("next-hop").await;
    origin
        .enqueue_local(&queue("in"), MessagePayload::new(b"job".to_vec()))
        .unwrap();
    let forward = next_hop.destination("out").unwrap();

    let received = receive_soon(&origin, &queue("in")).await;
    received
        .scope
        .send(&forward, MessagePayload::new(received.message.data.clone()))
        .unwrap();
    received.scope.rollback().unwrap();

    assert_eq!(origin.peek(&queue("in")).unwrap().len(), 1);
    assert!(next_hop.receive(&queue("out"), QUIET).await.unwrap().is_none());

    let received = receive_soon(&origin, &queue("in")).await;
    received
        .scope
        .send(&forward, MessagePayload::new(received.message.data.clone()))
        .unwrap();
    received.scope.commit().unwrap();

    assert!(origin.peek(&queue("in")).unwrap().is_empty());
    let forwarded = receive_soon(&next_hop, &queue("out")).await;
    assert_eq!(forwarded.message.data, b"job");
    forwarded.scope.commit().unwrap();

    origin.stop().await.unwrap();
    next_hop.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_move_to_subqueue() {
    let manager = start("local").await;
    manager
        .enqueue_local(&queue("h"), MessagePayload::new(vec![1]))
        .unwrap();

    let received = receive_soon(&manager, &queue("h")).await;
    received.scope.move_to(&received.message, "errors").unwrap();
    received.scope.commit().unwrap();

    let errors = queue("h").with_subqueue("errors").unwrap();
    assert!(manager.peek(&queue("h")).unwrap().is_empty());
    assert_eq!(manager.peek(&errors).unwrap()[0].id, received.message.id);
    assert_eq!(manager.subqueues("h").unwrap(), vec!["errors"]);

    let moved = receive_soon(&manager, &errors).await;
    assert_eq!(moved.message.queue, errors);
    moved.scope.commit().unwrap();

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ambient_commit_delivers_with_other_resources() {
    let receiver = start("receiver").await;
    let sender = start("sender").await;
    let database = Arc::new(RecordingParticipant::default());

    let ambient = AmbientTransaction::new();
    ambient.enlist(database.clone()).unwrap();
    let scope = sender.begin_scope_in(&ambient).unwrap();
    scope
        .send(&receiver.destination("h").unwrap(), MessagePayload::new(vec![7]))
        .unwrap();
    scope.commit().unwrap();
    assert_eq!(scope.state().unwrap(), ScopeState::CommitPending);
    assert!(sender.pending_outgoing().unwrap().is_empty());

    ambient.commit().await.unwrap();
    assert_eq!(scope.state().unwrap(), ScopeState::Committed);
    assert_eq!(database.committed.load(Ordering::SeqCst), 1);

    let received = receive_soon(&receiver, &queue("h")).await;
    assert_eq!(received.message.data, vec![7]);
    received.scope.commit().unwrap();

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ambient_veto_rolls_back_committed_scope() {
    let receiver = start("receiver").await;
    let sender = start("sender").await;
    let database = Arc::new(RecordingParticipant::default());
    database.veto.store(true, Ordering::SeqCst);

    let ambient = AmbientTransaction::new();
    ambient.enlist(database.clone()).unwrap();
    sender
        .send_in(
            &ambient,
            &receiver.destination("h").unwrap(),
            MessagePayload::new(vec![1]),
        )
        .unwrap();

    let err = ambient.commit().await.unwrap_err();
    assert!(matches!(err, Error::TransactionAborted { .. }));
    assert_eq!(database.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(database.committed.load(Ordering::SeqCst), 0);

    assert!(sender.pending_outgoing().unwrap().is_empty());
    assert!(receiver.receive(&queue("h"), QUIET).await.unwrap().is_none());

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uncommitted_enlisted_scope_vetoes() {
    let manager = start("local").await;
    let database = Arc::new(RecordingParticipant::default());

    let ambient = AmbientTransaction::new();
    let scope = manager.begin_scope_in(&ambient).unwrap();
    ambient.enlist(database.clone()).unwrap();
    scope
        .enqueue_local(&queue("h"), MessagePayload::new(vec![1]))
        .unwrap();

    assert!(ambient.commit().await.is_err());
    assert_eq!(database.prepared.load(Ordering::SeqCst), 0);
    assert_eq!(database.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(scope.state().unwrap(), ScopeState::RolledBack);
    assert!(manager.peek(&queue("h")).unwrap().is_empty());

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_ambient_rolls_back_scope() {
    let manager = start("local").await;
    {
        let ambient = AmbientTransaction::new();
        let scope = manager.begin_scope_in(&ambient).unwrap();
        scope
            .enqueue_local(&queue("h"), MessagePayload::new(vec![1]))
            .unwrap();
        scope.commit().unwrap();
    }

    assert!(manager.peek(&queue("h")).unwrap().is_empty());
    assert!(manager.receive(&queue("h"), QUIET).await.unwrap().is_none());

    manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ambient_rollback_overrides_scope_commit() {
    let manager = start("local").await;
    let database = Arc::new(RecordingParticipant::default());

    let ambient = AmbientTransaction::new();
    ambient.enlist(database.clone()).unwrap();
    let scope = manager.begin_scope_in(&ambient).unwrap();
    scope
        .send(&manager.destination("h").unwrap(), MessagePayload::new(vec![1]))
        .unwrap();
    scope.commit().unwrap();

    ambient.rollback().await.unwrap();
    assert_eq!(scope.state().unwrap(), ScopeState::RolledBack);
    assert_eq!(database.rolled_back.load(Ordering::SeqCst), 1);
    assert!(manager.pending_outgoing().unwrap().is_empty());
    assert!(manager.receive(&queue("h"), QUIET).await.unwrap().is_none());

    manager.stop().await.unwrap();
}
