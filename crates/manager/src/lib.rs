//! Quay Manager - transactional store-and-forward queue manager
//!
//! A [`QueueManager`] owns one message store, a listener for inbound batches,
//! an outbound delivery worker and the registry of local queues.
//!
//! # Example
//!
//! ```ignore
//! use quay_manager::{QueueManager, QueueManagerConfig};
//! use quay_core::{MessagePayload, QueueKey};
//!
//! let receiver = QueueManager::start(QueueManagerConfig::new("receiver").with_port(0)).await?;
//! let sender = QueueManager::start(QueueManagerConfig::new("sender").with_port(0)).await?;
//!
//! let scope = sender.begin_scope()?;
//! scope.send(&receiver.destination("h")?, MessagePayload::new(vec![1, 2, 4, 5]))?;
//! scope.commit()?;
//!
//! let mut stream = receiver.receive_stream(&QueueKey::new("h")?)?;
//! if let Some(received) = stream.next().await {
//!     let received = received?;
//!     received.scope.commit()?;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod ambient;
pub mod config;
pub mod delivery;
pub mod events;
mod listener;
mod manager;
pub mod receive;
mod registry;
pub mod scope;
mod shutdown;

pub use ambient::{AmbientTransaction, TransactionParticipant};
pub use config::{DeliveryConfig, ListenerConfig, QueueConfig, QueueManagerConfig, StorageConfig};
pub use delivery::{RetryPolicy, calculate_backoff};
pub use events::DeliveryEvent;
pub use manager::QueueManager;
pub use receive::{ReceiveStream, Received};
pub use registry::QueueRegistry;
pub use scope::{ScopeState, TransactionalScope};
pub use shutdown::ShutdownListener;
