//! Quay Wire - length-prefixed batch delivery protocol between queue managers
//!
//! One connection carries exactly one batch and its reply.
//!
//! # Protocol
//!
//! The sender writes one frame:
//! - **Length prefix**: 4-byte big-endian u32 indicating body size
//! - **Body**: the encoded [`DeliveryBatch`]
//!
//! ```text
//! +--------+--------+--------+--------+--------------------------+
//! | Byte 0 | Byte 1 | Byte 2 | Byte 3 | Bytes 4..(4+N)           |
//! |--------+--------+--------+--------+--------------------------|
//! |     Length (big-endian u32)       |    Batch body            |
//! |      N = body size                |    (N bytes)             |
//! +--------+--------+--------+--------+--------------------------+
//! ```
//!
//! The body is a sequence of fields; every variable-length field is preceded
//! by its own big-endian u32 length so no delimiter can be ambiguous:
//!
//! ```text
//! version:u8  transaction_id:[16]  source_host:str  source_port:u16  count:u32
//! count x ( message_id:[16]  queue:str  subqueue:str  header_count:u32
//!           header_count x ( key:str value:str )  sent_at_ms:i64  payload:bytes )
//! ```
//!
//! An empty `subqueue` means the default subqueue; an empty `source_host`
//! means the sender did not advertise an endpoint.
//!
//! The receiver answers with a single status byte, see [`Status`].
//!
//! # Constraints
//!
//! - Maximum frame body: 64MB
//! - Zero-length frames are rejected

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod codec;
mod error;
mod transport;

pub use codec::{DeliveryBatch, Status, decode_batch, encode_batch};
pub use error::{WireError, WireResult};
pub use transport::WireTransport;

/// Protocol version written as the first body byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum allowed frame body size in bytes (64MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;
