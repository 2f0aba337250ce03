//! In-memory store state and the deterministic application of journal entries.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use quay_core::{Message, MessageId, QueueKey, TransactionId};

use crate::journal::{
    ConsumedMessage, IncomingSection, JournalEntry, MovedMessage, StoreSnapshot,
};
use crate::record::{ClaimedBatch, IncomingRecord, OutgoingRecord, OutgoingState};

/// Bounded memory of committed inbound transaction ids.
#[derive(Debug, Default)]
pub(crate) struct DedupWindow {
    order: VecDeque<TransactionId>,
    seen: HashSet<TransactionId>,
    retention: usize,
}

impl DedupWindow {
    pub(crate) fn new(retention: usize) -> Self {
        Self {
            retention,
            ..Self::default()
        }
    }

    pub(crate) fn contains(&self, id: &TransactionId) -> bool {
        self.seen.contains(id)
    }

    pub(crate) fn insert(&mut self, id: TransactionId) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.retention {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    fn ids(&self) -> Vec<TransactionId> {
        self.order.iter().copied().collect()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Materialized view of the journal.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    /// Outgoing records grouped by batch, ordered by batch id.
    pub(crate) outgoing: BTreeMap<TransactionId, Vec<OutgoingRecord>>,
    pub(crate) incoming: BTreeMap<QueueKey, BTreeMap<MessageId, IncomingRecord>>,
    pub(crate) committed: DedupWindow,
}

impl StoreState {
    pub(crate) fn new(dedup_retention: usize) -> Self {
        Self {
            committed: DedupWindow::new(dedup_retention),
            ..Self::default()
        }
    }

    pub(crate) fn apply(&mut self, entry: &JournalEntry) {
        match entry {
            JournalEntry::ScopeCommitted {
                outgoing,
                consumed,
                moved,
                enqueued,
                ..
            } => {
                for record in outgoing {
                    self.insert_outgoing(record.clone());
                }
                for ConsumedMessage { queue, message_id } in consumed {
                    self.remove_incoming(queue, message_id);
                }
                for MovedMessage {
                    from,
                    message_id,
                    to,
                } in moved
                {
                    if let Some(mut record) = self.remove_incoming(from, message_id) {
                        record.message.queue = to.clone();
                        record.reserved_by = None;
                        self.insert_incoming(record.message);
                    }
                }
                for message in enqueued {
                    self.insert_incoming(message.clone());
                }
            }
            JournalEntry::IncomingAccepted {
                transaction_id,
                messages,
            } => {
                self.committed.insert(*transaction_id);
                for message in messages {
                    self.insert_incoming(message.clone());
                }
            }
            JournalEntry::BatchAttemptFailed {
                batch_id,
                error,
                retry_at,
            } => {
                for record in self.outgoing.get_mut(batch_id).into_iter().flatten() {
                    record.state = OutgoingState::Failed;
                    record.attempts = record.attempts.saturating_add(1);
                    record.next_attempt_at = *retry_at;
                    record.last_error = Some(error.clone());
                }
            }
            JournalEntry::BatchDelivered { batch_id } => {
                self.outgoing.remove(batch_id);
            }
            JournalEntry::Snapshot(snapshot) => self.restore(snapshot),
        }
    }

    fn restore(&mut self, snapshot: &StoreSnapshot) {
        self.outgoing.clear();
        self.incoming.clear();
        self.committed.clear();
        for record in &snapshot.outgoing {
            self.insert_outgoing(record.clone());
        }
        for section in &snapshot.incoming {
            for message in &section.messages {
                self.insert_incoming(message.clone());
            }
        }
        for id in &snapshot.committed_incoming {
            self.committed.insert(*id);
        }
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        let outgoing = self
            .outgoing
            .values()
            .flatten()
            .cloned()
            .map(|mut record| {
                if record.state == OutgoingState::Sending {
                    record.state = OutgoingState::Queued;
                }
                record
            })
            .collect();
        let incoming = self
            .incoming
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(queue, records)| IncomingSection {
                queue: queue.clone(),
                messages: records.values().map(|r| r.message.clone()).collect(),
            })
            .collect();
        StoreSnapshot {
            outgoing,
            incoming,
            committed_incoming: self.committed.ids(),
        }
    }

    fn insert_outgoing(&mut self, record: OutgoingRecord) {
        self.outgoing.entry(record.batch_id).or_default().push(record);
    }

    pub(crate) fn insert_incoming(&mut self, message: Message) {
        self.incoming
            .entry(message.queue.clone())
            .or_default()
            .entry(message.id)
            .or_insert_with(|| IncomingRecord::available(message));
    }

    fn remove_incoming(&mut self, queue: &QueueKey, id: &MessageId) -> Option<IncomingRecord> {
        let records = self.incoming.get_mut(queue)?;
        let removed = records.remove(id);
        if records.is_empty() {
            self.incoming.remove(queue);
        }
        removed
    }

    /// Reserve the first available message of `queue` for `scope`.
    pub(crate) fn reserve(&mut self, queue: &QueueKey, scope: TransactionId) -> Option<Message> {
        let record = self
            .incoming
            .get_mut(queue)?
            .values_mut()
            .find(|r| r.reserved_by.is_none())?;
        record.reserved_by = Some(scope);
        Some(record.message.clone())
    }

    pub(crate) fn is_reserved_by(
        &self,
        queue: &QueueKey,
        id: &MessageId,
        scope: TransactionId,
    ) -> bool {
        self.incoming
            .get(queue)
            .and_then(|records| records.get(id))
            .is_some_and(|r| r.reserved_by == Some(scope))
    }

    /// Return reservations to the available pool. Returns how many were released.
    pub(crate) fn release(&mut self, reservations: &[ConsumedMessage], scope: TransactionId) -> usize {
        let mut released = 0;
        for ConsumedMessage { queue, message_id } in reservations {
            let record = self
                .incoming
                .get_mut(queue)
                .and_then(|records| records.get_mut(message_id));
            if let Some(record) = record.filter(|r| r.reserved_by == Some(scope)) {
                record.reserved_by = None;
                released += 1;
            }
        }
        released
    }

    pub(crate) fn available(&self, queue: &QueueKey) -> Vec<Message> {
        self.incoming
            .get(queue)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|r| r.reserved_by.is_none())
            .map(|r| r.message.clone())
            .collect()
    }

    /// Move `Failed` batches whose retry time has passed back to `Queued`.
    pub(crate) fn requeue_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut requeued = 0;
        for records in self.outgoing.values_mut() {
            let due = records.first().is_some_and(|r| {
                r.state == OutgoingState::Failed && r.next_attempt_at.is_some_and(|at| at <= now)
            });
            if due {
                for record in records.iter_mut() {
                    record.state = OutgoingState::Queued;
                }
                requeued += 1;
            }
        }
        requeued
    }

    /// Mark up to `limit` queued batches as `Sending` and hand them out.
    pub(crate) fn claim(&mut self, limit: usize) -> Vec<ClaimedBatch> {
        let mut claimed = Vec::new();
        for (batch_id, records) in &mut self.outgoing {
            if claimed.len() >= limit {
                break;
            }
            let Some(first) = records.first() else {
                continue;
            };
            if !first.state.can_transition_to(OutgoingState::Sending) {
                continue;
            }
            let endpoint = first.endpoint.clone();
            let attempts = first.attempts;
            for record in records.iter_mut() {
                record.state = OutgoingState::Sending;
            }
            claimed.push(ClaimedBatch {
                batch_id: *batch_id,
                endpoint,
                messages: records.iter().map(|r| r.message.clone()).collect(),
                attempts,
            });
        }
        claimed
    }

    /// Schedule a claimed batch for another attempt at `retry_at`, in memory only.
    pub(crate) fn defer(
        &mut self,
        batch_id: &TransactionId,
        retry_at: DateTime<Utc>,
        error: &str,
    ) {
        for record in self.outgoing.get_mut(batch_id).into_iter().flatten() {
            record.state = OutgoingState::Failed;
            record.next_attempt_at = Some(retry_at);
            record.last_error = Some(error.to_string());
        }
    }

    /// Reset every `Sending` batch to `Queued`.
    pub(crate) fn requeue_sending(&mut self) -> usize {
        let mut requeued = 0;
        for records in self.outgoing.values_mut() {
            if records.first().is_some_and(|r| r.state == OutgoingState::Sending) {
                for record in records.iter_mut() {
                    record.state = OutgoingState::Queued;
                }
                requeued += 1;
            }
        }
        requeued
    }

    pub(crate) fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.outgoing
            .values()
            .filter_map(|records| records.first())
            .filter(|r| r.state == OutgoingState::Failed)
            .filter_map(|r| r.next_attempt_at)
            .min()
    }

    pub(crate) fn outgoing_records(&self) -> impl Iterator<Item = &OutgoingRecord> {
        self.outgoing.values().flatten()
    }
}
