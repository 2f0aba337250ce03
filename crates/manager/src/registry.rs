//! Queues and subqueues hosted by one manager.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use quay_core::{Error, QueueKey, Result};

use crate::config::QueueConfig;

/// Owned mapping of queue names to their subqueues.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: RwLock<BTreeMap<String, BTreeSet<String>>>,
    auto_create: bool,
}

impl QueueRegistry {
    /// Registry seeded with `queues`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` for an invalid queue or subqueue name.
    pub fn new(queues: &[QueueConfig], auto_create: bool) -> Result<Self> {
        let registry = Self {
            queues: RwLock::new(BTreeMap::new()),
            auto_create,
        };
        for queue in queues {
            registry.create(&queue.name, &queue.subqueues)?;
        }
        Ok(registry)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, BTreeSet<String>>>> {
        self.queues
            .read()
            .map_err(|_| Error::storage("registry", "registry lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, BTreeSet<String>>>> {
        self.queues
            .write()
            .map_err(|_| Error::storage("registry", "registry lock poisoned"))
    }

    /// Register `name` with `subqueues`, merging with any existing entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` for an invalid queue or subqueue name.
    pub fn create(&self, name: &str, subqueues: &[String]) -> Result<()> {
        let root = QueueKey::new(name)?;
        for sub in subqueues {
            root.clone().with_subqueue(sub)?;
        }
        let mut queues = self.write()?;
        let entry = queues.entry(name.to_string()).or_default();
        entry.extend(subqueues.iter().cloned());
        Ok(())
    }

    /// Make sure `key` can hold messages, creating it if allowed.
    ///
    /// Subqueues of a registered queue are always created on demand.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` for an unregistered queue when auto-creation is off.
    pub fn resolve(&self, key: &QueueKey) -> Result<()> {
        {
            let queues = self.read()?;
            if let Some(subqueues) = queues.get(key.queue()) {
                if key.subqueue().is_none_or(|sub| subqueues.contains(sub)) {
                    return Ok(());
                }
            } else if !self.auto_create {
                return Err(Error::queue_not_found(key.queue()));
            }
        }

        let mut queues = self.write()?;
        let subqueues = queues.entry(key.queue().to_string()).or_default();
        if let Some(sub) = key.subqueue() {
            subqueues.insert(sub.to_string());
        }
        tracing::debug!(queue = %key, "Queue created on demand");
        Ok(())
    }

    /// Whether the queue part of `key` is registered.
    #[must_use]
    pub fn contains(&self, key: &QueueKey) -> bool {
        self.read()
            .map(|queues| queues.contains_key(key.queue()))
            .unwrap_or(false)
    }

    /// Whether unknown queues are created on demand.
    #[must_use]
    pub const fn auto_creates(&self) -> bool {
        self.auto_create
    }

    /// Registered queue names in order.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the registry lock is poisoned.
    pub fn queues(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    /// Subqueues of `queue` in order.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` if `queue` is not registered.
    pub fn subqueues(&self, queue: &str) -> Result<Vec<String>> {
        self.read()?
            .get(queue)
            .map(|subs| subs.iter().cloned().collect())
            .ok_or_else(|| Error::queue_not_found(queue))
    }
}
