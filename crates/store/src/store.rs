//! Transactional message store shared by a queue manager's tasks.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use quay_core::{Endpoint, Error, Message, MessageId, QueueKey, Result, TransactionId};
use tokio::sync::Notify;

use crate::journal::{ConsumedMessage, FileJournal, Journal, JournalEntry, MemoryJournal, MovedMessage};
use crate::record::{ClaimedBatch, IncomingOutcome, OutgoingRecord};
use crate::state::StoreState;

/// Next attempt for a batch whose delivery outcome could not be journaled.
fn outcome_retry_at() -> DateTime<Utc> {
    Utc::now() + TimeDelta::seconds(1)
}

/// Tuning for a [`QueueStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// fsync every journal frame.
    pub sync_writes: bool,
    /// Journal frames written between snapshots.
    pub compact_after: usize,
    /// Committed inbound transaction ids remembered for duplicate suppression.
    pub dedup_retention: usize,
    /// Messages per outgoing batch; a scope sending more is split.
    pub max_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_writes: true,
            compact_after: 10_000,
            dedup_retention: 100_000,
            max_batch_size: 100,
        }
    }
}

/// Uncommitted work of one scope.
#[derive(Debug, Default)]
struct ScopeWork {
    outgoing: Vec<(Endpoint, Message)>,
    enqueued: Vec<Message>,
    reserved: Vec<ConsumedMessage>,
    moved: Vec<MovedMessage>,
    prepared: bool,
}

impl ScopeWork {
    fn is_empty(&self) -> bool {
        self.outgoing.is_empty()
            && self.enqueued.is_empty()
            && self.reserved.is_empty()
            && self.moved.is_empty()
    }
}

struct Inner {
    state: StoreState,
    journal: Box<dyn Journal>,
    scopes: HashMap<TransactionId, ScopeWork>,
    frames_since_compaction: usize,
    closed: bool,
}

impl Inner {
    fn scope_mut(&mut self, tx: TransactionId) -> Result<&mut ScopeWork> {
        self.scopes
            .get_mut(&tx)
            .ok_or_else(|| Error::scope_misuse(tx.to_string(), "scope is not open in the store"))
    }

    /// A scope that still accepts new work; prepared scopes are frozen.
    fn staging_mut(&mut self, tx: TransactionId) -> Result<&mut ScopeWork> {
        let work = self.scope_mut(tx)?;
        if work.prepared {
            return Err(Error::scope_misuse(tx.to_string(), "scope is already prepared"));
        }
        Ok(work)
    }

    /// Journal then apply. A failed append leaves memory untouched.
    fn write(&mut self, entry: JournalEntry, compact_after: usize) -> Result<()> {
        self.journal.append(&entry)?;
        self.state.apply(&entry);
        self.frames_since_compaction += 1;

        if self.frames_since_compaction >= compact_after {
            match self.journal.compact(&self.state.snapshot()) {
                Ok(()) => self.frames_since_compaction = 0,
                Err(e) => tracing::warn!(error = %e, "Journal compaction failed"),
            }
        }
        Ok(())
    }
}

/// Durable store of outgoing and incoming messages.
///
/// Every mutation is made under a scope token obtained from
/// [`begin`](Self::begin) and stays invisible until [`commit`](Self::commit).
/// Messages handed out by [`dequeue_incoming`](Self::dequeue_incoming) are
/// reserved for the calling scope until it commits or rolls back.
pub struct QueueStore {
    inner: Mutex<Inner>,
    options: StoreOptions,
    incoming: Notify,
    outgoing: Notify,
}

impl QueueStore {
    /// Open a journaled store in `dir`, replaying prior state.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the journal cannot be opened or read.
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self> {
        let journal = FileJournal::open(dir, options.sync_writes)?;
        tracing::info!(path = %journal.path().display(), "Opening message store");
        Self::with_journal(Box::new(journal), options)
    }

    /// Volatile store backed by an in-memory journal.
    ///
    /// # Errors
    ///
    /// Never fails in practice; kept fallible to match [`open`](Self::open).
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        Self::with_journal(Box::new(MemoryJournal::new()), options)
    }

    /// Build a store on an arbitrary journal, replaying its entries.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if replay fails.
    pub fn with_journal(mut journal: Box<dyn Journal>, options: StoreOptions) -> Result<Self> {
        let entries = journal.replay()?;
        let mut state = StoreState::new(options.dedup_retention);
        for entry in &entries {
            state.apply(entry);
        }
        let requeued = state.requeue_sending();

        let outgoing = state.outgoing_records().count();
        let incoming: usize = state.incoming.values().map(BTreeMap::len).sum();
        if !entries.is_empty() {
            tracing::info!(
                frames = entries.len(),
                outgoing,
                incoming,
                requeued,
                "Message store recovered"
            );
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                journal,
                scopes: HashMap::new(),
                frames_since_compaction: entries.len(),
                closed: false,
            }),
            options,
            incoming: Notify::new(),
            outgoing: Notify::new(),
        })
    }

    #[must_use]
    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Woken whenever incoming messages become available.
    #[must_use]
    pub const fn incoming_signal(&self) -> &Notify {
        &self.incoming
    }

    /// Woken whenever outgoing work is committed or requeued.
    #[must_use]
    pub const fn outgoing_signal(&self) -> &Notify {
        &self.outgoing
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::storage("lock", "store lock poisoned"))
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        if inner.closed {
            return Err(Error::ShutDown);
        }
        Ok(inner)
    }

    /// Register a new scope.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the store is closed.
    pub fn begin(&self) -> Result<TransactionId> {
        let mut inner = self.lock_open()?;
        let tx = TransactionId::new();
        inner.scopes.insert(tx, ScopeWork::default());
        Ok(tx)
    }

    /// Stage an outgoing message; invisible to delivery until commit.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` for an unknown scope or `ShutDown`.
    pub fn persist_outgoing(
        &self,
        tx: TransactionId,
        endpoint: Endpoint,
        message: Message,
    ) -> Result<MessageId> {
        let mut inner = self.lock_open()?;
        let work = inner.staging_mut(tx)?;
        let id = message.id;
        work.outgoing.push((endpoint, message));
        Ok(id)
    }

    /// Stage a message for a local incoming queue.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` for an unknown scope or `ShutDown`.
    pub fn enqueue_local(&self, tx: TransactionId, message: Message) -> Result<MessageId> {
        let mut inner = self.lock_open()?;
        let work = inner.staging_mut(tx)?;
        let id = message.id;
        work.enqueued.push(message);
        Ok(id)
    }

    /// Reserve the next available message of `queue` for `tx`.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` for an unknown scope or `ShutDown`.
    pub fn dequeue_incoming(&self, tx: TransactionId, queue: &QueueKey) -> Result<Option<Message>> {
        let mut inner = self.lock_open()?;
        inner.staging_mut(tx)?;
        let Some(message) = inner.state.reserve(queue, tx) else {
            return Ok(None);
        };
        inner.staging_mut(tx)?.reserved.push(ConsumedMessage {
            queue: queue.clone(),
            message_id: message.id,
        });
        Ok(Some(message))
    }

    /// On commit, relocate a message reserved by `tx` to `subqueue` of its queue.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` if `tx` does not hold the message or already moved it.
    pub fn move_to(&self, tx: TransactionId, message: &Message, subqueue: &str) -> Result<()> {
        let to = message.queue.root().with_subqueue(subqueue)?;
        let mut inner = self.lock_open()?;
        if !inner.state.is_reserved_by(&message.queue, &message.id, tx) {
            return Err(Error::scope_misuse(
                tx.to_string(),
                format!("message {} is not reserved by this scope", message.id),
            ));
        }
        let work = inner.staging_mut(tx)?;
        if work.moved.iter().any(|m| m.message_id == message.id) {
            return Err(Error::scope_misuse(
                tx.to_string(),
                format!("message {} is already being moved", message.id),
            ));
        }
        work.moved.push(MovedMessage {
            from: message.queue.clone(),
            message_id: message.id,
            to,
        });
        Ok(())
    }

    /// First phase of an ambient commit: confirm `tx` can be committed.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` for an unknown scope or `ShutDown`.
    pub fn prepare(&self, tx: TransactionId) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.scope_mut(tx)?.prepared = true;
        Ok(())
    }

    /// Make everything staged under `tx` durable and visible.
    ///
    /// On a storage failure the scope is rolled back before the error returns.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure`, `ScopeMisuse` for an unknown scope, or `ShutDown`.
    pub fn commit(&self, tx: TransactionId) -> Result<()> {
        let mut inner = self.lock_open()?;
        let work = inner
            .scopes
            .remove(&tx)
            .ok_or_else(|| Error::scope_misuse(tx.to_string(), "scope is not open in the store"))?;
        if work.is_empty() {
            return Ok(());
        }

        let moved_ids: Vec<MessageId> = work.moved.iter().map(|m| m.message_id).collect();
        let consumed: Vec<ConsumedMessage> = work
            .reserved
            .iter()
            .filter(|r| !moved_ids.contains(&r.message_id))
            .cloned()
            .collect();
        let outgoing = assign_batches(work.outgoing, self.options.max_batch_size);
        let has_outgoing = !outgoing.is_empty();
        let makes_available = !work.enqueued.is_empty() || !work.moved.is_empty();
        let (sent, received) = (outgoing.len(), consumed.len());

        let entry = JournalEntry::ScopeCommitted {
            transaction_id: tx,
            outgoing,
            consumed,
            moved: work.moved,
            enqueued: work.enqueued,
        };
        if let Err(e) = inner.write(entry, self.options.compact_after) {
            let released = inner.state.release(&work.reserved, tx);
            drop(inner);
            tracing::error!(transaction_id = %tx, error = %e, "Scope commit failed, rolled back");
            if released > 0 {
                self.incoming.notify_waiters();
            }
            return Err(e);
        }
        drop(inner);

        tracing::debug!(transaction_id = %tx, sent, received, "Scope committed");
        if has_outgoing {
            self.outgoing.notify_one();
        }
        if makes_available {
            self.incoming.notify_waiters();
        }
        Ok(())
    }

    /// Discard staged writes of `tx` and release its reservations.
    ///
    /// # Errors
    ///
    /// Returns `ScopeMisuse` for an unknown scope or `ShutDown`.
    pub fn rollback(&self, tx: TransactionId) -> Result<()> {
        let mut inner = self.lock_open()?;
        let work = inner
            .scopes
            .remove(&tx)
            .ok_or_else(|| Error::scope_misuse(tx.to_string(), "scope is not open in the store"))?;
        let released = inner.state.release(&work.reserved, tx);
        drop(inner);

        tracing::debug!(transaction_id = %tx, released, "Scope rolled back");
        if released > 0 {
            self.incoming.notify_waiters();
        }
        Ok(())
    }

    /// Roll back every open scope. Returns how many there were.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn rollback_all(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let scopes: Vec<_> = inner.scopes.drain().collect();
        let mut released = 0;
        for (tx, work) in &scopes {
            released += inner.state.release(&work.reserved, *tx);
        }
        drop(inner);

        if !scopes.is_empty() {
            tracing::info!(scopes = scopes.len(), released, "Rolled back open scopes");
        }
        if released > 0 {
            self.incoming.notify_waiters();
        }
        Ok(scopes.len())
    }

    /// Atomically store a batch received from a peer.
    ///
    /// A transaction id that was already committed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the batch cannot be journaled, or `ShutDown`.
    pub fn persist_incoming(
        &self,
        tx: TransactionId,
        messages: Vec<Message>,
    ) -> Result<IncomingOutcome> {
        let mut inner = self.lock_open()?;
        if inner.state.committed.contains(&tx) {
            drop(inner);
            tracing::info!(transaction_id = %tx, "Duplicate suppressed");
            return Ok(IncomingOutcome::Duplicate);
        }

        let count = messages.len();
        inner.write(
            JournalEntry::IncomingAccepted {
                transaction_id: tx,
                messages,
            },
            self.options.compact_after,
        )?;
        drop(inner);

        tracing::debug!(transaction_id = %tx, count, "Batch accepted");
        self.incoming.notify_waiters();
        Ok(IncomingOutcome::Accepted)
    }

    /// Claim up to `limit` batches that are queued or due for retry.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the store is closed.
    pub fn claim_outgoing(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedBatch>> {
        let mut inner = self.lock_open()?;
        inner.state.requeue_due(now);
        Ok(inner.state.claim(limit))
    }

    /// Record a positive acknowledgment and delete the batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the outcome cannot be journaled; the batch
    /// is then scheduled for another attempt.
    pub fn complete_batch(&self, batch_id: TransactionId) -> Result<()> {
        let mut inner = self.lock_open()?;
        if !inner.state.outgoing.contains_key(&batch_id) {
            return Ok(());
        }
        let written = inner.write(
            JournalEntry::BatchDelivered { batch_id },
            self.options.compact_after,
        );
        if let Err(e) = &written {
            // Resent later; the receiver suppresses the duplicate.
            inner.state.defer(&batch_id, outcome_retry_at(), &e.to_string());
        }
        written
    }

    /// Record a failed attempt. `retry_at = None` fails the batch permanently.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the outcome cannot be journaled; the batch
    /// stays retryable in memory.
    pub fn fail_batch(
        &self,
        batch_id: TransactionId,
        error: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock_open()?;
        if !inner.state.outgoing.contains_key(&batch_id) {
            return Ok(());
        }
        let error = error.into();
        let written = inner.write(
            JournalEntry::BatchAttemptFailed {
                batch_id,
                error: error.clone(),
                retry_at,
            },
            self.options.compact_after,
        );
        if written.is_err() {
            let at = retry_at.unwrap_or_else(outcome_retry_at);
            inner.state.defer(&batch_id, at, &error);
        }
        written
    }

    /// Return claimed batches to `Queued`, e.g. after aborting deliveries.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn requeue_sending(&self) -> Result<usize> {
        let requeued = self.lock()?.state.requeue_sending();
        if requeued > 0 {
            self.outgoing.notify_one();
        }
        Ok(requeued)
    }

    /// Earliest scheduled retry.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock()?.state.next_retry_at())
    }

    /// Available (unreserved) messages of `queue`, without reserving them.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn peek(&self, queue: &QueueKey) -> Result<Vec<Message>> {
        Ok(self.lock()?.state.available(queue))
    }

    /// Stored incoming messages per queue partition, reserved ones included.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn queue_depths(&self) -> Result<BTreeMap<QueueKey, usize>> {
        Ok(self
            .lock()?
            .state
            .incoming
            .iter()
            .map(|(queue, records)| (queue.clone(), records.len()))
            .collect())
    }

    /// Outgoing records still owed a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn pending_outgoing(&self) -> Result<Vec<OutgoingRecord>> {
        Ok(self
            .lock()?
            .state
            .outgoing_records()
            .filter(|r| r.is_pending())
            .cloned()
            .collect())
    }

    /// Outgoing records that failed permanently.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn failed_outgoing(&self) -> Result<Vec<OutgoingRecord>> {
        Ok(self
            .lock()?
            .state
            .outgoing_records()
            .filter(|r| r.is_permanently_failed())
            .cloned()
            .collect())
    }

    /// Whether any outgoing record is still owed a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn has_pending_outgoing(&self) -> Result<bool> {
        Ok(self.lock()?.state.outgoing_records().any(OutgoingRecord::is_pending))
    }

    /// Number of scopes begun but not yet finalized.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn open_transactions(&self) -> Result<usize> {
        Ok(self.lock()?.scopes.len())
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().map_or(true, |inner| inner.closed)
    }

    /// Roll back open scopes and refuse further work.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store lock is poisoned.
    pub fn close(&self) -> Result<()> {
        self.rollback_all()?;
        let mut inner = self.lock()?;
        if !inner.closed {
            inner.closed = true;
            tracing::info!("Message store closed");
        }
        drop(inner);
        self.incoming.notify_waiters();
        Ok(())
    }
}

/// Split a scope's sends into per-endpoint batches of at most `max` messages.
fn assign_batches(outgoing: Vec<(Endpoint, Message)>, max: usize) -> Vec<OutgoingRecord> {
    let mut by_endpoint: Vec<(Endpoint, Vec<Message>)> = Vec::new();
    for (endpoint, message) in outgoing {
        match by_endpoint.iter_mut().find(|(e, _)| *e == endpoint) {
            Some((_, messages)) => messages.push(message),
            None => by_endpoint.push((endpoint, vec![message])),
        }
    }

    let mut records = Vec::new();
    for (endpoint, messages) in by_endpoint {
        let mut messages = messages.into_iter().peekable();
        while messages.peek().is_some() {
            let batch_id = TransactionId::new();
            records.extend(
                messages
                    .by_ref()
                    .take(max.max(1))
                    .map(|m| OutgoingRecord::queued(m, endpoint.clone(), batch_id)),
            );
        }
    }
    records
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use quay_core::MessagePayload;

    fn store() -> QueueStore {
        QueueStore::in_memory(StoreOptions::default()).unwrap()
    }

    fn queue(name: &str) -> QueueKey {
        QueueKey::new(name).unwrap()
    }

    fn message(name: &str, data: &[u8]) -> Message {
        Message::new(queue(name), MessagePayload::new(data.to_vec()))
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 23457)
    }

    #[test]
    fn test_outgoing_invisible_until_commit() {
        let store = store();
        let tx = store.begin().unwrap();
        store.persist_outgoing(tx, endpoint(), message("h", &[1])).unwrap();
        assert!(store.claim_outgoing(Utc::now(), 10).unwrap().is_empty());

        store.commit(tx).unwrap();
        let claimed = store.claim_outgoing(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].messages[0].data, vec![1]);
    }

    #[test]
    fn test_rollback_discards_outgoing() {
        let store = store();
        let tx = store.begin().unwrap();
        for n in 0..3 {
            store.persist_outgoing(tx, endpoint(), message("h", &[n])).unwrap();
        }
        store.rollback(tx).unwrap();
        assert!(store.pending_outgoing().unwrap().is_empty());
        assert!(store.claim_outgoing(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_transaction_is_noop() {
        let store = store();
        let tx = TransactionId::new();
        let batch = vec![message("h", &[1, 2, 4, 5])];
        assert_eq!(
            store.persist_incoming(tx, batch.clone()).unwrap(),
            IncomingOutcome::Accepted
        );
        assert_eq!(
            store.persist_incoming(tx, batch).unwrap(),
            IncomingOutcome::Duplicate
        );
        assert_eq!(store.peek(&queue("h")).unwrap().len(), 1);
    }

    #[test]
    fn test_reservation_excludes_other_scopes() {
        let store = store();
        store
            .persist_incoming(TransactionId::new(), vec![message("h", &[1])])
            .unwrap();
        let a = store.begin().unwrap();
        let b = store.begin().unwrap();
        assert!(store.dequeue_incoming(a, &queue("h")).unwrap().is_some());
        assert!(store.dequeue_incoming(b, &queue("h")).unwrap().is_none());

        store.rollback(a).unwrap();
        assert!(store.dequeue_incoming(b, &queue("h")).unwrap().is_some());
        store.commit(b).unwrap();
        assert!(store.peek(&queue("h")).unwrap().is_empty());
        assert!(store.queue_depths().unwrap().is_empty());
    }

    #[test]
    fn test_move_to_subqueue_on_commit() {
        let store = store();
        store
            .persist_incoming(TransactionId::new(), vec![message("h", &[7])])
            .unwrap();
        let tx = store.begin().unwrap();
        let m = store.dequeue_incoming(tx, &queue("h")).unwrap().unwrap();
        store.move_to(tx, &m, "errors").unwrap();
        assert!(store.move_to(tx, &m, "errors").is_err());
        store.commit(tx).unwrap();

        let errors = queue("h").with_subqueue("errors").unwrap();
        assert!(store.peek(&queue("h")).unwrap().is_empty());
        assert_eq!(store.peek(&errors).unwrap()[0].id, m.id);
    }

    #[test]
    fn test_move_requires_reservation() {
        let store = store();
        let tx = store.begin().unwrap();
        let err = store.move_to(tx, &message("h", &[1]), "sub").unwrap_err();
        assert!(matches!(err, Error::ScopeMisuse { .. }));
    }

    #[test]
    fn test_enqueue_local_visible_after_commit() {
        let store = store();
        let tx = store.begin().unwrap();
        store.enqueue_local(tx, message("h", &[3])).unwrap();
        assert!(store.peek(&queue("h")).unwrap().is_empty());
        store.commit(tx).unwrap();
        assert_eq!(store.peek(&queue("h")).unwrap().len(), 1);
    }

    #[test]
    fn test_batches_split_by_endpoint_and_size() {
        let options = StoreOptions {
            max_batch_size: 2,
            ..StoreOptions::default()
        };
        let store = QueueStore::in_memory(options).unwrap();
        let tx = store.begin().unwrap();
        for n in 0..5 {
            store.persist_outgoing(tx, endpoint(), message("h", &[n])).unwrap();
        }
        store
            .persist_outgoing(tx, Endpoint::new("other", 1), message("h", &[9]))
            .unwrap();
        store.commit(tx).unwrap();

        let claimed = store.claim_outgoing(Utc::now(), 10).unwrap();
        let mut sizes: Vec<_> = claimed.iter().map(|b| b.messages.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_failed_commit_rolls_scope_back() {
        let (journal, store) = journaled_store();
        store
            .persist_incoming(TransactionId::new(), vec![message("h", &[1])])
            .unwrap();
        let tx = store.begin().unwrap();
        store.dequeue_incoming(tx, &queue("h")).unwrap().unwrap();
        store.persist_outgoing(tx, endpoint(), message("h", &[2])).unwrap();

        journal.set_failing(true);
        let err = store.commit(tx).unwrap_err();
        assert!(matches!(err, Error::StorageFailure { .. }));
        journal.set_failing(false);

        assert_eq!(store.open_transactions().unwrap(), 0);
        assert_eq!(store.peek(&queue("h")).unwrap().len(), 1);
        assert!(store.pending_outgoing().unwrap().is_empty());
    }

    fn journaled_store() -> (MemoryJournal, QueueStore) {
        let journal = MemoryJournal::new();
        let store =
            QueueStore::with_journal(Box::new(journal.clone()), StoreOptions::default()).unwrap();
        (journal, store)
    }

    fn claimed_batch(store: &QueueStore) -> ClaimedBatch {
        let tx = store.begin().unwrap();
        store.persist_outgoing(tx, endpoint(), message("h", &[1])).unwrap();
        store.commit(tx).unwrap();
        store.claim_outgoing(Utc::now(), 1).unwrap().remove(0)
    }

    #[test]
    fn test_unrecorded_failure_stays_retryable() {
        let (journal, store) = journaled_store();
        let batch = claimed_batch(&store);

        let now = Utc::now();
        journal.set_failing(true);
        assert!(store.fail_batch(batch.batch_id, "refused", Some(now)).is_err());
        journal.set_failing(false);

        assert_eq!(store.next_retry_at().unwrap(), Some(now));
        let again = store.claim_outgoing(now, 1).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].batch_id, batch.batch_id);
    }

    #[test]
    fn test_unrecorded_ack_is_resent() {
        let (journal, store) = journaled_store();
        let batch = claimed_batch(&store);

        journal.set_failing(true);
        assert!(store.complete_batch(batch.batch_id).is_err());
        journal.set_failing(false);

        assert!(store.has_pending_outgoing().unwrap());
        assert!(store.claim_outgoing(Utc::now(), 1).unwrap().is_empty());
        let later = Utc::now() + TimeDelta::seconds(2);
        let again = store.claim_outgoing(later, 1).unwrap();
        assert_eq!(again[0].batch_id, batch.batch_id);

        store.complete_batch(batch.batch_id).unwrap();
        assert!(!store.has_pending_outgoing().unwrap());
    }

    #[test]
    fn test_unrecorded_permanent_failure_is_retried() {
        let (journal, store) = journaled_store();
        let batch = claimed_batch(&store);

        journal.set_failing(true);
        assert!(store.fail_batch(batch.batch_id, "unknown queue", None).is_err());
        journal.set_failing(false);

        assert!(store.failed_outgoing().unwrap().is_empty());
        assert!(store.next_retry_at().unwrap().is_some());
    }

    #[test]
    fn test_second_commit_is_misuse() {
        let store = store();
        let tx = store.begin().unwrap();
        store.commit(tx).unwrap();
        assert!(matches!(store.commit(tx), Err(Error::ScopeMisuse { .. })));
    }

    #[test]
    fn test_prepared_scope_is_frozen() {
        let store = store();
        let tx = store.begin().unwrap();
        store.persist_outgoing(tx, endpoint(), message("h", &[1])).unwrap();
        store.prepare(tx).unwrap();
        assert!(matches!(
            store.persist_outgoing(tx, endpoint(), message("h", &[2])),
            Err(Error::ScopeMisuse { .. })
        ));

        store.commit(tx).unwrap();
        assert_eq!(store.pending_outgoing().unwrap().len(), 1);
    }

    #[test]
    fn test_permanent_failure_is_reported() {
        let store = store();
        let tx = store.begin().unwrap();
        store.persist_outgoing(tx, endpoint(), message("h", &[1])).unwrap();
        store.commit(tx).unwrap();
        let batch = store.claim_outgoing(Utc::now(), 1).unwrap().remove(0);

        store.fail_batch(batch.batch_id, "unknown queue", None).unwrap();
        assert!(!store.has_pending_outgoing().unwrap());
        let failed = store.failed_outgoing().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("unknown queue"));
        assert!(store.claim_outgoing(Utc::now(), 1).unwrap().is_empty());
    }

    #[test]
    fn test_close_rolls_back_and_refuses_work() {
        let store = store();
        store
            .persist_incoming(TransactionId::new(), vec![message("h", &[1])])
            .unwrap();
        let tx = store.begin().unwrap();
        store.dequeue_incoming(tx, &queue("h")).unwrap();

        store.close().unwrap();
        assert!(store.is_closed());
        assert_eq!(store.peek(&queue("h")).unwrap().len(), 1);
        assert!(matches!(store.begin(), Err(Error::ShutDown)));
    }
}
