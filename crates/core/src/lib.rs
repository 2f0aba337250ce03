//! Core types, errors, and addressing for Quay.
//!
//! Every other crate in the workspace builds on these definitions:
//!
//! - **Identifiers**: [`MessageId`] and [`TransactionId`] (ULID-backed)
//! - **Addressing**: [`Endpoint`], [`QueueKey`], [`Destination`]
//! - **Messages**: [`MessagePayload`] from callers, [`Message`] once accepted
//! - **Errors**: [`Error`] and the [`Result`] alias

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod address;
pub mod error;
pub mod result;
pub mod types;

pub use address::Destination;
pub use error::Error;
pub use result::Result;
pub use types::{
    Endpoint, Headers, MAX_QUEUE_NAME_LEN, Message, MessageId, MessagePayload, QueueKey,
    TransactionId,
};
