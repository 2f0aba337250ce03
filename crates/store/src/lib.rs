//! Quay Store - journaled transactional message store
//!
//! Holds a queue manager's pending-outgoing records and unconsumed incoming
//! messages. All mutations are grouped by scope and become durable as a single
//! journal frame on commit, so a crash never exposes half of a scope.
//!
//! - **Records**: outgoing delivery state machine and incoming reservations
//! - **Journal**: checksummed write-ahead frames with snapshot compaction
//! - **Store**: thread-safe façade used by the manager's tasks

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod journal;
pub mod record;
mod state;
mod store;

pub use journal::{
    FileJournal, JOURNAL_FILE, Journal, JournalEntry, MemoryJournal, StoreSnapshot,
};
pub use record::{ClaimedBatch, IncomingOutcome, IncomingRecord, OutgoingRecord, OutgoingState};
pub use store::{QueueStore, StoreOptions};
