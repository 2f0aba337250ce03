//! Queue manager configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quay_core::{Endpoint, Error, Result};
use quay_store::StoreOptions;
use serde::{Deserialize, Serialize};

/// Everything a queue manager needs at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueManagerConfig {
    /// Diagnostic label used in logs.
    #[serde(default = "default_name")]
    pub name: String,

    /// Host the listener binds and advertises to peers.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener port; `0` lets the OS choose.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Queues registered at start-up.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,

    /// Create unknown queues on demand instead of rejecting them.
    #[serde(default = "default_true")]
    pub auto_create_queues: bool,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    /// Grace period for in-flight work when stopping.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Where and how messages are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage directory. Absent means a volatile in-memory store.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub sync_writes: bool,

    #[serde(default = "default_compact_after")]
    pub compact_after: usize,

    #[serde(default = "default_dedup_retention")]
    pub dedup_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_writes: true,
            compact_after: default_compact_after(),
            dedup_retention: default_dedup_retention(),
        }
    }
}

/// A queue and its declared subqueues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub subqueues: Vec<String>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subqueues: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_subqueue(mut self, subqueue: impl Into<String>) -> Self {
        self.subqueues.push(subqueue.into());
        self
    }
}

/// Outbound delivery tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Messages per wire batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrent outbound batches.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed to send a batch and read the reply.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Upper bound on the worker's idle sleep.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts before a batch fails permanently. Absent retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_in_flight: default_max_in_flight(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: None,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Inbound connection handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Time a peer has to send its complete batch.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl ListenerConfig {
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            storage: StorageConfig::default(),
            queues: Vec::new(),
            auto_create_queues: true,
            delivery: DeliveryConfig::default(),
            listener: ListenerConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl QueueManagerConfig {
    /// Config named `name` with all other fields defaulted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the document is malformed or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Set the listener port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Persist to `path` instead of memory.
    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = Some(path.into());
        self
    }

    /// Register a queue at start-up.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    /// Reject unknown queues instead of creating them.
    #[must_use]
    pub const fn strict_queues(mut self) -> Self {
        self.auto_create_queues = false;
        self
    }

    /// Replace the delivery settings.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Endpoint the listener binds to.
    #[must_use]
    pub fn bind_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Options for the message store this config describes.
    #[must_use]
    pub const fn store_options(&self) -> StoreOptions {
        StoreOptions {
            sync_writes: self.storage.sync_writes,
            compact_after: self.storage.compact_after,
            dedup_retention: self.storage.dedup_retention,
            max_batch_size: self.delivery.max_batch_size,
        }
    }

    /// Check field combinations the type system cannot.
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("name must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.delivery.max_batch_size == 0 {
            return Err(Error::config("delivery.max_batch_size must be at least 1"));
        }
        if self.delivery.max_in_flight == 0 {
            return Err(Error::config("delivery.max_in_flight must be at least 1"));
        }
        if self.delivery.max_backoff_ms < self.delivery.base_backoff_ms {
            return Err(Error::config(
                "delivery.max_backoff_ms must not be below delivery.base_backoff_ms",
            ));
        }
        if self.delivery.max_attempts == Some(0) {
            return Err(Error::config("delivery.max_attempts must be at least 1"));
        }
        if self.storage.compact_after == 0 {
            return Err(Error::config("storage.compact_after must be at least 1"));
        }
        for queue in &self.queues {
            let key = quay_core::QueueKey::new(&queue.name)
                .map_err(|e| Error::config(format!("queue {:?}: {e}", queue.name)))?;
            for sub in &queue.subqueues {
                key.clone()
                    .with_subqueue(sub)
                    .map_err(|e| Error::config(format!("queue {:?}: {e}", queue.name)))?;
            }
        }
        Ok(())
    }
}

fn default_name() -> String {
    "quay".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    2200
}

const fn default_true() -> bool {
    true
}

const fn default_compact_after() -> usize {
    10_000
}

const fn default_dedup_retention() -> usize {
    100_000
}

const fn default_max_batch_size() -> usize {
    100
}

const fn default_max_in_flight() -> usize {
    8
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_ack_timeout_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_base_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_read_timeout_ms() -> u64 {
    30_000
}

const fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = QueueManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, QueueManagerConfig::default());
        assert_eq!(config.port, 2200);
        assert!(config.auto_create_queues);
        assert_eq!(config.delivery.max_attempts, None);
    }

    #[test]
    fn test_full_document() {
        let config = QueueManagerConfig::from_toml_str(
            r#"
            name = "receiver"
            port = 23457
            auto_create_queues = false
            shutdown_timeout_ms = 250

            [storage]
            path = "/var/lib/quay"
            sync_writes = false

            [[queues]]
            name = "h"
            subqueues = ["errors", "audit"]

            [delivery]
            max_batch_size = 10
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "receiver");
        assert_eq!(config.port, 23457);
        assert!(!config.auto_create_queues);
        assert_eq!(config.storage.path, Some(PathBuf::from("/var/lib/quay")));
        assert_eq!(config.queues[0].subqueues, vec!["errors", "audit"]);
        assert_eq!(config.delivery.max_attempts, Some(3));
        assert_eq!(config.delivery.base_backoff_ms, 100);
        assert_eq!(config.store_options().max_batch_size, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "name = \"\"",
            "[delivery]\nmax_batch_size = 0",
            "[delivery]\nmax_attempts = 0",
            "[delivery]\nbase_backoff_ms = 500\nmax_backoff_ms = 100",
            "[[queues]]\nname = \"a/b\"",
        ];
        for case in cases {
            let err = QueueManagerConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "{case}: {err:?}");
        }
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = QueueManagerConfig::from_toml_str("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
