//! Core value types shared by every crate.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::Error;
use crate::result::Result;

/// Maximum length of a queue or subqueue name in bytes.
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Unique identifier for a message, stable across delivery retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Create a new random message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Rebuild an ID from its 16-byte wire form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    /// Get the 16-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a transactional scope or a delivered batch.
///
/// Outbound batches keep the same ID for every retry, which is what lets the
/// receiving store recognise a resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Ulid);

impl TransactionId {
    /// Create a new random transaction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Rebuild an ID from its 16-byte wire form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    /// Get the 16-byte wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a queue manager's listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A queue and optional subqueue.
///
/// A queue without a subqueue is the default partition of that queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    queue: String,
    subqueue: Option<String>,
}

impl QueueKey {
    /// Address the default subqueue of `queue`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` if the name is empty, too long, or contains `/`.
    pub fn new(queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        validate_name(&queue)?;
        Ok(Self {
            queue,
            subqueue: None,
        })
    }

    /// Address a named subqueue of this key's queue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` if the subqueue name is invalid.
    pub fn with_subqueue(self, subqueue: impl Into<String>) -> Result<Self> {
        let subqueue = subqueue.into();
        validate_name(&subqueue)?;
        Ok(Self {
            queue: self.queue,
            subqueue: Some(subqueue),
        })
    }

    /// Address `queue` with an optional subqueue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` if either name is invalid.
    pub fn from_parts(queue: impl Into<String>, subqueue: Option<String>) -> Result<Self> {
        let key = Self::new(queue)?;
        match subqueue {
            Some(sub) => key.with_subqueue(sub),
            None => Ok(key),
        }
    }

    /// The queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The subqueue name, if any.
    #[must_use]
    pub fn subqueue(&self) -> Option<&str> {
        self.subqueue.as_deref()
    }

    /// The default partition of the same queue.
    #[must_use]
    pub fn root(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            subqueue: None,
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subqueue {
            Some(sub) => write!(f, "{}/{}", self.queue, sub),
            None => write!(f, "{}", self.queue),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_queue_name(name, "name is empty"));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(Error::invalid_queue_name(
            name,
            format!("name exceeds {MAX_QUEUE_NAME_LEN} bytes"),
        ));
    }
    if name.contains('/') {
        return Err(Error::invalid_queue_name(name, "name contains '/'"));
    }
    Ok(())
}

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// Caller-constructed outbound data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// Optional string headers.
    pub headers: Headers,
}

impl MessagePayload {
    /// Create a payload from raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            headers: Headers::new(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// The durable unit once a payload has been accepted into the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned at creation, stable across retries.
    pub id: MessageId,
    /// Target queue and subqueue.
    pub queue: QueueKey,
    /// Queue manager that sent the message; set on the receiving side.
    pub source: Option<Endpoint>,
    /// String headers.
    pub headers: Headers,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// When the sender created the message.
    pub sent_at: DateTime<Utc>,
    /// When the receiving store accepted the message.
    pub arrived_at: Option<DateTime<Utc>>,
    /// Batch the message was delivered in.
    pub transaction_id: Option<TransactionId>,
}

impl Message {
    /// Wrap a payload addressed to `queue` in a new message.
    #[must_use]
    pub fn new(queue: QueueKey, payload: MessagePayload) -> Self {
        Self {
            id: MessageId::new(),
            queue,
            source: None,
            headers: payload.headers,
            data: payload.data,
            // Millisecond precision, as carried on the wire.
            sent_at: Utc::now().trunc_subsecs(3),
            arrived_at: None,
            transaction_id: None,
        }
    }

    /// Stamp the receiving-side attributes onto a delivered message.
    #[must_use]
    pub fn arrived(
        mut self,
        transaction_id: TransactionId,
        source: Option<Endpoint>,
        at: DateTime<Utc>,
    ) -> Self {
        self.transaction_id = Some(transaction_id);
        self.source = source;
        self.arrived_at = Some(at);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn test_id_byte_form_is_stable() {
        let id = TransactionId::new();
        assert_eq!(TransactionId::from_bytes(id.to_bytes()), id);
        let id = MessageId::new();
        assert_eq!(MessageId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn test_queue_key_display() {
        let key = QueueKey::new("h").unwrap();
        assert_eq!(key.to_string(), "h");
        let key = key.with_subqueue("errors").unwrap();
        assert_eq!(key.to_string(), "h/errors");
        assert_eq!(key.root().to_string(), "h");
    }

    #[test]
    fn test_queue_key_rejects_bad_names() {
        assert!(QueueKey::new("").is_err());
        assert!(QueueKey::new("a/b").is_err());
        assert!(QueueKey::new("x".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
        assert!(QueueKey::new("h").unwrap().with_subqueue("").is_err());
    }

    #[test]
    fn test_payload_builder() {
        let payload = MessagePayload::new(vec![1, 2, 4, 5]).with_header("kind", "ping");
        assert_eq!(payload.data, vec![1, 2, 4, 5]);
        assert_eq!(payload.headers.get("kind").map(String::as_str), Some("ping"));
    }

    #[test]
    fn test_sent_at_has_millisecond_precision() {
        let message = Message::new(QueueKey::new("h").unwrap(), MessagePayload::new(vec![1]));
        assert_eq!(message.sent_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_message_arrival_stamp() {
        let queue = QueueKey::new("h").unwrap();
        let msg = Message::new(queue, MessagePayload::new(vec![9]));
        assert!(msg.arrived_at.is_none());

        let tx = TransactionId::new();
        let arrived = msg.arrived(tx, Some(Endpoint::new("localhost", 2200)), Utc::now());
        assert_eq!(arrived.transaction_id, Some(tx));
        assert!(arrived.arrived_at.is_some());
        assert_eq!(arrived.source.map(|e| e.port), Some(2200));
    }

    #[test]
    fn test_message_serde_round_trip_preserves_identity() {
        let msg = Message::new(QueueKey::new("h").unwrap(), MessagePayload::new(vec![1]));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
