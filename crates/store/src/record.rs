//! Persisted record shapes for both sides of a delivery.

use chrono::{DateTime, Utc};
use quay_core::{Endpoint, Message, TransactionId};
use serde::{Deserialize, Serialize};

/// Delivery state of an outgoing message.
///
/// `Queued -> Sending -> Sent` on success, `Queued -> Sending -> Failed -> Queued`
/// on a retryable failure. A `Failed` record with no retry time is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutgoingState {
    /// Committed and waiting for the delivery worker.
    Queued,
    /// Claimed by the delivery worker; never journaled.
    Sending,
    /// Acknowledged by the receiver; the record is deleted in the same step.
    Sent,
    /// Last attempt failed.
    Failed,
}

impl OutgoingState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Sending)
                | (Self::Sending, Self::Sent | Self::Failed | Self::Queued)
                | (Self::Failed, Self::Queued)
        )
    }
}

impl std::fmt::Display for OutgoingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A message awaiting delivery to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub message: Message,
    pub endpoint: Endpoint,
    /// Wire transaction id; reused on every retry.
    pub batch_id: TransactionId,
    pub state: OutgoingState,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// When a `Failed` record becomes eligible again. `None` while failed
    /// means the record failed permanently.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutgoingRecord {
    /// A freshly committed record.
    #[must_use]
    pub const fn queued(message: Message, endpoint: Endpoint, batch_id: TransactionId) -> Self {
        Self {
            message,
            endpoint,
            batch_id,
            state: OutgoingState::Queued,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Failed with no scheduled retry.
    #[must_use]
    pub fn is_permanently_failed(&self) -> bool {
        self.state == OutgoingState::Failed && self.next_attempt_at.is_none()
    }

    /// Still owed a delivery attempt.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.is_permanently_failed() && self.state != OutgoingState::Sent
    }
}

/// A received message held until a consumer commits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRecord {
    pub message: Message,
    /// Scope currently holding the message. Reservations live only in memory,
    /// so a restart makes every record available again.
    pub reserved_by: Option<TransactionId>,
}

impl IncomingRecord {
    #[must_use]
    pub const fn available(message: Message) -> Self {
        Self {
            message,
            reserved_by: None,
        }
    }
}

/// Result of persisting an inbound batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// New transaction; the messages are now stored.
    Accepted,
    /// Transaction was already committed; nothing changed.
    Duplicate,
}

impl IncomingOutcome {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// A group of outgoing records claimed for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub batch_id: TransactionId,
    pub endpoint: Endpoint,
    pub messages: Vec<Message>,
    /// Attempts already made before this one.
    pub attempts: u32,
}
