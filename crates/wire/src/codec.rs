//! Batch body codec and the status token.

use chrono::{DateTime, Utc};
use quay_core::{Endpoint, Headers, Message, MessageId, QueueKey, TransactionId};

use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION, WireError, WireResult};

/// Smallest possible encoded message: id, three empty length prefixes,
/// timestamp, empty payload prefix.
const MIN_MESSAGE_SIZE: usize = 16 + 4 + 4 + 4 + 8 + 4;

/// One delivery attempt: every message in it is applied or rejected together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryBatch {
    /// Same value on every retry of the batch.
    pub transaction_id: TransactionId,
    /// Listener endpoint of the sending manager.
    pub source: Option<Endpoint>,
    /// Messages in the batch.
    pub messages: Vec<Message>,
}

impl DeliveryBatch {
    /// Create a batch.
    #[must_use]
    pub const fn new(
        transaction_id: TransactionId,
        source: Option<Endpoint>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            transaction_id,
            source,
            messages,
        }
    }

    /// Stamp receiving-side attributes onto each message.
    #[must_use]
    pub fn into_arrived(self, at: DateTime<Utc>) -> (TransactionId, Vec<Message>) {
        let tx = self.transaction_id;
        let source = self.source;
        let messages = self
            .messages
            .into_iter()
            .map(|m| m.arrived(tx, source.clone(), at))
            .collect();
        (tx, messages)
    }
}

/// Receiver's single-byte reply to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Batch persisted (or already persisted earlier).
    Acknowledged,
    /// Batch could not be persisted; the sender keeps it and retries.
    Reverted,
    /// Batch names a queue the receiver does not host.
    UnknownQueue,
}

impl Status {
    /// Encode as the status byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Acknowledged => 0x01,
            Self::Reverted => 0x02,
            Self::UnknownQueue => 0x03,
        }
    }

    /// Decode a status byte.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStatus` for any other byte.
    pub const fn from_byte(byte: u8) -> WireResult<Self> {
        match byte {
            0x01 => Ok(Self::Acknowledged),
            0x02 => Ok(Self::Reverted),
            0x03 => Ok(Self::UnknownQueue),
            _ => Err(WireError::UnknownStatus { byte }),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Acknowledged => "acknowledged",
            Self::Reverted => "reverted",
            Self::UnknownQueue => "unknown_queue",
        };
        write!(f, "{s}")
    }
}

/// Encode a batch body (without the outer length prefix).
///
/// # Errors
///
/// Returns `MessageTooLarge` if a field or the whole body exceeds its limit.
pub fn encode_batch(batch: &DeliveryBatch) -> WireResult<Vec<u8>> {
    let mut out = Encoder::default();
    out.put_u8(PROTOCOL_VERSION);
    out.put_raw(&batch.transaction_id.to_bytes());
    match &batch.source {
        Some(endpoint) => {
            out.put_str(&endpoint.host)?;
            out.put_u16(endpoint.port);
        }
        None => {
            out.put_str("")?;
            out.put_u16(0);
        }
    }
    out.put_len(batch.messages.len())?;

    for message in &batch.messages {
        out.put_raw(&message.id.to_bytes());
        out.put_str(message.queue.queue())?;
        out.put_str(message.queue.subqueue().unwrap_or(""))?;
        out.put_len(message.headers.len())?;
        for (key, value) in &message.headers {
            out.put_str(key)?;
            out.put_str(value)?;
        }
        out.put_i64(message.sent_at.timestamp_millis());
        out.put_bytes(&message.data)?;
    }

    if out.buf.len() > MAX_FRAME_SIZE {
        return Err(WireError::message_too_large(out.buf.len(), MAX_FRAME_SIZE));
    }
    Ok(out.buf)
}

/// Decode a batch body (without the outer length prefix).
///
/// # Errors
///
/// Returns `UnsupportedVersion` or `Malformed` when the body is not a valid batch.
pub fn decode_batch(body: &[u8]) -> WireResult<DeliveryBatch> {
    let mut input = Decoder::new(body);

    let version = input.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion { version });
    }
    let transaction_id = TransactionId::from_bytes(input.array16("transaction_id")?);

    let host = input.string("source_host")?;
    let port = input.u16("source_port")?;
    let source = (!host.is_empty()).then(|| Endpoint::new(host, port));

    let count = input.u32("count")? as usize;
    if count.saturating_mul(MIN_MESSAGE_SIZE) > input.remaining() {
        return Err(WireError::malformed(
            "count",
            format!("{count} messages cannot fit in {} bytes", input.remaining()),
        ));
    }

    let mut messages = Vec::with_capacity(count);
    for _ in 0..count {
        let id = MessageId::from_bytes(input.array16("message_id")?);
        let queue = input.string("queue")?;
        let subqueue = input.string("subqueue")?;
        let queue = QueueKey::from_parts(queue, (!subqueue.is_empty()).then_some(subqueue))
            .map_err(|e| WireError::malformed("queue", e.to_string()))?;

        let header_count = input.u32("header_count")? as usize;
        let mut headers = Headers::new();
        for _ in 0..header_count {
            let key = input.string("header_key")?;
            let value = input.string("header_value")?;
            headers.insert(key, value);
        }

        let millis = input.i64("sent_at")?;
        let sent_at = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| WireError::malformed("sent_at", format!("{millis} out of range")))?;
        let data = input.bytes("payload")?.to_vec();

        messages.push(Message {
            id,
            queue,
            source: None,
            headers,
            data,
            sent_at,
            arrived_at: None,
            transaction_id: None,
        });
    }

    if input.remaining() != 0 {
        return Err(WireError::malformed(
            "trailer",
            format!("{} unexpected trailing bytes", input.remaining()),
        ));
    }

    Ok(DeliveryBatch {
        transaction_id,
        source,
        messages,
    })
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_len(&mut self, len: usize) -> WireResult<()> {
        let len =
            u32::try_from(len).map_err(|_| WireError::message_too_large(len, u32::MAX as usize))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.put_len(bytes.len())?;
        self.put_raw(bytes);
        Ok(())
    }

    fn put_str(&mut self, s: &str) -> WireResult<()> {
        self.put_bytes(s.as_bytes())
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize, field: &'static str) -> WireResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| WireError::malformed(field, "length overflow"))?;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            WireError::malformed(
                field,
                format!("needs {n} bytes, {} remaining", self.remaining()),
            )
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> WireResult<[u8; N]> {
        let slice = self.take(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn array16(&mut self, field: &'static str) -> WireResult<[u8; 16]> {
        self.array::<16>(field)
    }

    fn u8(&mut self, field: &'static str) -> WireResult<u8> {
        Ok(u8::from_be_bytes(self.array::<1>(field)?))
    }

    fn u16(&mut self, field: &'static str) -> WireResult<u16> {
        Ok(u16::from_be_bytes(self.array::<2>(field)?))
    }

    fn u32(&mut self, field: &'static str) -> WireResult<u32> {
        Ok(u32::from_be_bytes(self.array::<4>(field)?))
    }

    fn i64(&mut self, field: &'static str) -> WireResult<i64> {
        Ok(i64::from_be_bytes(self.array::<8>(field)?))
    }

    fn bytes(&mut self, field: &'static str) -> WireResult<&'a [u8]> {
        let len = self.u32(field)? as usize;
        self.take(len, field)
    }

    fn string(&mut self, field: &'static str) -> WireResult<String> {
        let bytes = self.bytes(field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::malformed(field, format!("invalid utf-8: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use quay_core::MessagePayload;

    fn sample_batch() -> DeliveryBatch {
        let queue = QueueKey::new("h").unwrap();
        let messages = vec![
            Message::new(
                queue.clone(),
                MessagePayload::new(vec![1, 2, 4, 5]).with_header("kind", "ping"),
            ),
            Message::new(
                queue.with_subqueue("errors").unwrap(),
                MessagePayload::new(Vec::new()),
            ),
        ];
        DeliveryBatch::new(
            TransactionId::new(),
            Some(Endpoint::new("localhost", 23456)),
            messages,
        )
    }

    #[test]
    fn test_decode_preserves_fields() {
        let batch = sample_batch();
        let body = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&body).unwrap();

        assert_eq!(decoded.transaction_id, batch.transaction_id);
        assert_eq!(decoded.source, batch.source);
        assert_eq!(decoded.messages.len(), 2);
        for (got, want) in decoded.messages.iter().zip(&batch.messages) {
            assert_eq!(got.id, want.id);
            assert_eq!(got.queue, want.queue);
            assert_eq!(got.headers, want.headers);
            assert_eq!(got.data, want.data);
            assert_eq!(got.sent_at, want.sent_at);
        }
    }

    #[test]
    fn test_empty_source_decodes_as_none() {
        let mut batch = sample_batch();
        batch.source = None;
        let decoded = decode_batch(&encode_batch(&batch).unwrap()).unwrap();
        assert_eq!(decoded.source, None);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let body = encode_batch(&sample_batch()).unwrap();
        for cut in [1, 10, 17, body.len() - 1] {
            let result = decode_batch(&body[..cut]);
            assert!(
                matches!(result, Err(WireError::Malformed { .. })),
                "cut at {cut} gave {result:?}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut body = encode_batch(&sample_batch()).unwrap();
        body.push(0);
        assert!(matches!(
            decode_batch(&body),
            Err(WireError::Malformed {
                field: "trailer",
                ..
            })
        ));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut body = encode_batch(&sample_batch()).unwrap();
        body[0] = 99;
        assert_eq!(
            decode_batch(&body),
            Err(WireError::UnsupportedVersion { version: 99 })
        );
    }

    #[test]
    fn test_absurd_count_is_rejected_without_allocation() {
        let mut batch = sample_batch();
        batch.messages.clear();
        let mut body = encode_batch(&batch).unwrap();
        let len = body.len();
        body[len - 4..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_batch(&body),
            Err(WireError::Malformed { field: "count", .. })
        ));
    }

    #[test]
    fn test_status_bytes() {
        for status in [Status::Acknowledged, Status::Reverted, Status::UnknownQueue] {
            assert_eq!(Status::from_byte(status.to_byte()), Ok(status));
        }
        assert_eq!(
            Status::from_byte(0),
            Err(WireError::UnknownStatus { byte: 0 })
        );
    }

    #[test]
    fn test_into_arrived_stamps_messages() {
        let batch = sample_batch();
        let tx = batch.transaction_id;
        let (got_tx, messages) = batch.into_arrived(Utc::now());
        assert_eq!(got_tx, tx);
        assert!(messages.iter().all(|m| m.transaction_id == Some(tx)));
        assert!(messages.iter().all(|m| m.arrived_at.is_some()));
        assert!(
            messages
                .iter()
                .all(|m| m.source.as_ref().map(|s| s.port) == Some(23456))
        );
    }
}
