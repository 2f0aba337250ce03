//! Delivery outcomes published to interested callers.

use std::time::Duration;

use quay_core::{Endpoint, MessageId, TransactionId};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Outcome of one outbound delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// The receiver acknowledged the batch.
    Delivered {
        batch_id: TransactionId,
        endpoint: Endpoint,
        message_ids: Vec<MessageId>,
    },
    /// The attempt failed and the batch is scheduled again.
    Retrying {
        batch_id: TransactionId,
        endpoint: Endpoint,
        attempt: u32,
        retry_in: Duration,
        error: String,
    },
    /// The batch will not be retried.
    Failed {
        batch_id: TransactionId,
        endpoint: Endpoint,
        message_ids: Vec<MessageId>,
        error: String,
    },
}

impl DeliveryEvent {
    #[must_use]
    pub const fn batch_id(&self) -> TransactionId {
        match self {
            Self::Delivered { batch_id, .. }
            | Self::Retrying { batch_id, .. }
            | Self::Failed { batch_id, .. } => *batch_id,
        }
    }
}

/// Broadcast fan-out of [`DeliveryEvent`]s. Lagging subscribers lose old events.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryEvents {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryEvents {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: DeliveryEvent) {
        // No subscribers is normal.
        let _ = self.tx.send(event);
    }
}
