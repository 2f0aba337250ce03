//! Write-ahead journal of committed store mutations.
//!
//! Every committed scope, accepted batch and delivery outcome is appended as
//! one frame before it is applied in memory, so a frame is the unit of
//! atomicity: on replay a frame is either applied whole or, if torn by a
//! crash, discarded together with everything after it.
//!
//! ```text
//! +----------------+--------------------+------------------------+
//! | length: u32 BE | sha256(payload)    | payload (bincode)      |
//! | 4 bytes        | 32 bytes           | length bytes           |
//! +----------------+--------------------+------------------------+
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use quay_core::{Error, Message, MessageId, QueueKey, Result, TransactionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::OutgoingRecord;

/// Journal file name inside the storage directory.
pub const JOURNAL_FILE: &str = "quay.journal";

const CHECKSUM_SIZE: usize = 32;
const HEADER_SIZE: usize = 4 + CHECKSUM_SIZE;

/// A consumed incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessage {
    pub queue: QueueKey,
    pub message_id: MessageId,
}

/// An incoming message relocated to another subqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedMessage {
    pub from: QueueKey,
    pub message_id: MessageId,
    pub to: QueueKey,
}

/// Messages of one queue partition in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingSection {
    pub queue: QueueKey,
    pub messages: Vec<Message>,
}

/// Full store state, written when the journal is compacted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub outgoing: Vec<OutgoingRecord>,
    pub incoming: Vec<IncomingSection>,
    /// Committed inbound transaction ids, oldest first.
    pub committed_incoming: Vec<TransactionId>,
}

/// One durable mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Everything a local scope did, applied atomically.
    ScopeCommitted {
        transaction_id: TransactionId,
        outgoing: Vec<OutgoingRecord>,
        consumed: Vec<ConsumedMessage>,
        moved: Vec<MovedMessage>,
        enqueued: Vec<Message>,
    },
    /// A batch received from a peer.
    IncomingAccepted {
        transaction_id: TransactionId,
        messages: Vec<Message>,
    },
    /// A delivery attempt failed. `retry_at = None` is a permanent failure.
    BatchAttemptFailed {
        batch_id: TransactionId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },
    /// The receiver acknowledged the batch; its records are deleted.
    BatchDelivered { batch_id: TransactionId },
    /// Replaces all prior state.
    Snapshot(StoreSnapshot),
}

/// Durable append-only log backing a store.
pub trait Journal: Send {
    /// Read every intact entry, discarding a torn tail.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the log cannot be read.
    fn replay(&mut self) -> Result<Vec<JournalEntry>>;

    /// Durably append one entry. On failure nothing is appended.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the write fails.
    fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Replace the log with a single snapshot entry.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the snapshot cannot be written.
    fn compact(&mut self, snapshot: &StoreSnapshot) -> Result<()>;
}

/// Encode an entry as one checksummed frame.
///
/// # Errors
///
/// Returns `StorageFailure` if the entry cannot be serialized.
pub fn encode_frame(entry: &JournalEntry) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(entry, bincode::config::standard())
        .map_err(|e| Error::storage("journal encode", e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::storage("journal encode", "entry exceeds 4GiB"))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&Sha256::digest(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Entries decoded from a journal image.
#[derive(Debug, Default)]
pub struct DecodedFrames {
    pub entries: Vec<JournalEntry>,
    /// Bytes covered by intact frames.
    pub valid_len: usize,
}

/// Decode frames until the first incomplete, corrupt or undecodable one.
#[must_use]
pub fn decode_frames(bytes: &[u8]) -> DecodedFrames {
    let mut decoded = DecodedFrames::default();
    let mut pos = 0usize;

    while let Some((entry, frame_len)) = decode_one(bytes.get(pos..).unwrap_or_default()) {
        decoded.entries.push(entry);
        pos += frame_len;
    }
    decoded.valid_len = pos;
    decoded
}

fn decode_one(bytes: &[u8]) -> Option<(JournalEntry, usize)> {
    let length = u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let checksum = bytes.get(4..HEADER_SIZE)?;
    let end = HEADER_SIZE.checked_add(length)?;
    let payload = bytes.get(HEADER_SIZE..end)?;
    if Sha256::digest(payload).as_slice() != checksum {
        return None;
    }
    let (entry, read) =
        bincode::serde::decode_from_slice::<JournalEntry, _>(payload, bincode::config::standard())
            .ok()?;
    (read == payload.len()).then_some((entry, end))
}

/// Journal stored as a single file in a storage directory.
pub struct FileJournal {
    dir: PathBuf,
    path: PathBuf,
    file: File,
    len: u64,
    sync_writes: bool,
}

impl FileJournal {
    /// Open or create the journal in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the directory or file cannot be opened.
    pub fn open(dir: &Path, sync_writes: bool) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::storage("journal open", e.to_string()))?;
        let path = dir.join(JOURNAL_FILE);

        let stale = tmp_path(&path);
        if stale.exists() {
            tracing::warn!(path = %stale.display(), "Removing stale compaction file");
            let _ = fs::remove_file(&stale);
        }

        let file = open_append(&path)?;
        let len = file
            .metadata()
            .map_err(|e| Error::storage("journal open", e.to_string()))?
            .len();

        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            file,
            len,
            sync_writes,
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync_dir(&self) {
        #[cfg(unix)]
        {
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }
    }
}

impl Journal for FileJournal {
    fn replay(&mut self) -> Result<Vec<JournalEntry>> {
        let bytes = fs::read(&self.path).map_err(|e| Error::storage("journal read", e.to_string()))?;
        let decoded = decode_frames(&bytes);

        if decoded.valid_len < bytes.len() {
            tracing::warn!(
                path = %self.path.display(),
                valid_bytes = decoded.valid_len,
                discarded_bytes = bytes.len() - decoded.valid_len,
                "Journal tail truncated"
            );
            let valid = decoded.valid_len as u64;
            self.file
                .set_len(valid)
                .map_err(|e| Error::storage("journal truncate", e.to_string()))?;
            self.file
                .sync_all()
                .map_err(|e| Error::storage("journal truncate", e.to_string()))?;
            self.len = valid;
        }

        Ok(decoded.entries)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;

        let written = self.file.write_all(&frame).and_then(|()| {
            if self.sync_writes {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // Drop whatever part of the frame reached the file.
            let _ = self.file.set_len(self.len);
            return Err(Error::storage("journal append", e.to_string()));
        }

        self.len += frame.len() as u64;
        Ok(())
    }

    fn compact(&mut self, snapshot: &StoreSnapshot) -> Result<()> {
        let frame = encode_frame(&JournalEntry::Snapshot(snapshot.clone()))?;
        let tmp = tmp_path(&self.path);

        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&frame)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write_tmp().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::storage("journal compact", e.to_string())
        })?;
        self.sync_dir();

        self.file = open_append(&self.path)?;
        self.len = frame.len() as u64;
        tracing::info!(
            path = %self.path.display(),
            bytes = self.len,
            outgoing = snapshot.outgoing.len(),
            "Journal compacted"
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("journal.tmp")
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::storage("journal open", e.to_string()))
}

#[derive(Debug, Default)]
struct MemoryImage {
    bytes: Vec<u8>,
    failing: bool,
}

/// Journal kept in memory, for volatile stores and tests.
///
/// Clones share the same image, so a test can keep a handle, inject write
/// failures, or reopen a store from the bytes written so far.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    image: Arc<Mutex<MemoryImage>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing journal image.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            image: Arc::new(Mutex::new(MemoryImage {
                bytes,
                failing: false,
            })),
        }
    }

    /// Current journal image.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.image
            .lock()
            .map(|image| image.bytes.clone())
            .unwrap_or_default()
    }

    /// Make subsequent appends and compactions fail.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut image) = self.image.lock() {
            image.failing = failing;
        }
    }

    fn with_image<T>(&self, op: &str, f: impl FnOnce(&mut MemoryImage) -> Result<T>) -> Result<T> {
        let mut image = self
            .image
            .lock()
            .map_err(|_| Error::storage(op, "journal lock poisoned"))?;
        if image.failing {
            return Err(Error::storage(op, "injected failure"));
        }
        f(&mut image)
    }
}

impl Journal for MemoryJournal {
    fn replay(&mut self) -> Result<Vec<JournalEntry>> {
        self.with_image("journal read", |image| {
            let decoded = decode_frames(&image.bytes);
            image.bytes.truncate(decoded.valid_len);
            Ok(decoded.entries)
        })
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        self.with_image("journal append", |image| {
            image.bytes.extend_from_slice(&frame);
            Ok(())
        })
    }

    fn compact(&mut self, snapshot: &StoreSnapshot) -> Result<()> {
        let frame = encode_frame(&JournalEntry::Snapshot(snapshot.clone()))?;
        self.with_image("journal compact", |image| {
            image.bytes = frame;
            Ok(())
        })
    }
}
