//! The queue manager façade.

use std::sync::Arc;
use std::time::Duration;

use quay_core::{
    Destination, Endpoint, Error, Message, MessageId, MessagePayload, QueueKey, Result,
};
use quay_store::{OutgoingRecord, QueueStore};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::ambient::AmbientTransaction;
use crate::config::QueueManagerConfig;
use crate::delivery::{DeliveryContext, DeliveryWorker, RetryPolicy};
use crate::events::{DeliveryEvent, DeliveryEvents};
use crate::listener::{Listener, ListenerContext};
use crate::receive::{ReceiveStream, Received, next_message};
use crate::registry::QueueRegistry;
use crate::scope::TransactionalScope;
use crate::shutdown::Shutdown;

struct Tasks {
    listener: JoinHandle<()>,
    worker: JoinHandle<()>,
}

struct Shared {
    config: QueueManagerConfig,
    endpoint: Endpoint,
    store: Arc<QueueStore>,
    registry: Arc<QueueRegistry>,
    events: DeliveryEvents,
    shutdown: Shutdown,
    tasks: Mutex<Option<Tasks>>,
}

/// A running queue manager: store, listener, delivery worker and queue registry.
///
/// Cheap to clone; all clones drive the same manager. The background tasks
/// stop when [`stop`](Self::stop) is called or the last clone is dropped.
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    /// Open the store, bind the listener and start the delivery worker.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid config, `StorageFailure` if the store
    /// cannot be opened, or `ConnectionFailure` if the listener cannot bind.
    pub async fn start(config: QueueManagerConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(match &config.storage.path {
            Some(path) => QueueStore::open(path, config.store_options())?,
            None => QueueStore::in_memory(config.store_options())?,
        });
        let registry = Arc::new(QueueRegistry::new(
            &config.queues,
            config.auto_create_queues,
        )?);

        let bind = config.bind_endpoint();
        let listener = TcpListener::bind((bind.host.as_str(), bind.port))
            .await
            .map_err(|e| Error::connection(bind.to_string(), format!("bind failed: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::connection(bind.to_string(), e.to_string()))?
            .port();
        let endpoint = Endpoint::new(config.host.clone(), port);

        let shutdown = Shutdown::new();
        let events = DeliveryEvents::new();
        let drain_timeout = config.shutdown_timeout();

        let listener = Listener::new(
            listener,
            ListenerContext {
                store: Arc::clone(&store),
                registry: Arc::clone(&registry),
                read_timeout: config.listener.read_timeout(),
            },
            shutdown.subscribe(),
            drain_timeout,
        );
        let worker = DeliveryWorker::new(
            DeliveryContext {
                store: Arc::clone(&store),
                source: endpoint.clone(),
                config: config.delivery.clone(),
                policy: RetryPolicy::from_config(&config.delivery),
                events: events.clone(),
            },
            shutdown.subscribe(),
            drain_timeout,
        );
        let tasks = Tasks {
            listener: tokio::spawn(listener.run()),
            worker: tokio::spawn(worker.run()),
        };

        tracing::info!(
            name = %config.name,
            endpoint = %endpoint,
            persistent = config.storage.path.is_some(),
            "Queue manager started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                endpoint,
                store,
                registry,
                events,
                shutdown,
                tasks: Mutex::new(Some(tasks)),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    #[must_use]
    pub fn config(&self) -> &QueueManagerConfig {
        &self.shared.config
    }

    /// Endpoint peers use to reach this manager.
    #[must_use]
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Destination naming `queue` on this manager.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` for an invalid name.
    pub fn destination(&self, queue: &str) -> Result<Destination> {
        Ok(Destination::new(
            self.shared.endpoint.clone(),
            QueueKey::new(queue)?,
        ))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_triggered()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Start a scope that commits on its own.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the manager is stopping.
    pub fn begin_scope(&self) -> Result<TransactionalScope> {
        self.ensure_running()?;
        TransactionalScope::begin(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.registry),
        )
    }

    /// Start a scope enlisted in `ambient`; it commits when `ambient` does.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the manager is stopping.
    pub fn begin_scope_in(&self, ambient: &AmbientTransaction) -> Result<TransactionalScope> {
        self.ensure_running()?;
        TransactionalScope::begin_in(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.registry),
            ambient,
        )
    }

    /// Send one payload in its own committed scope.
    ///
    /// Success means the message is durably queued, not yet delivered.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` or `ShutDown`.
    pub fn send(&self, destination: &Destination, payload: MessagePayload) -> Result<MessageId> {
        let scope = self.begin_scope()?;
        let id = scope.send(destination, payload)?;
        scope.commit()?;
        Ok(id)
    }

    /// Send one payload as part of `ambient`.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` or `ShutDown`.
    pub fn send_in(
        &self,
        ambient: &AmbientTransaction,
        destination: &Destination,
        payload: MessagePayload,
    ) -> Result<MessageId> {
        let scope = self.begin_scope_in(ambient)?;
        let id = scope.send(destination, payload)?;
        scope.commit()?;
        Ok(id)
    }

    /// Put a payload straight into a local queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound`, `StorageFailure` or `ShutDown`.
    pub fn enqueue_local(&self, queue: &QueueKey, payload: MessagePayload) -> Result<MessageId> {
        let scope = self.begin_scope()?;
        let id = scope.enqueue_local(queue, payload)?;
        scope.commit()?;
        Ok(id)
    }

    /// Subscribe to `queue`.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` for an unknown queue when auto-creation is off.
    pub fn receive_stream(&self, queue: &QueueKey) -> Result<ReceiveStream> {
        self.ensure_running()?;
        self.shared.registry.resolve(queue)?;
        Ok(ReceiveStream::new(
            queue.clone(),
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.registry),
            self.shared.shutdown.subscribe(),
        ))
    }

    /// Wait up to `timeout` for one message.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` or `StorageFailure`.
    pub async fn receive(&self, queue: &QueueKey, timeout: Duration) -> Result<Option<Received>> {
        self.ensure_running()?;
        self.shared.registry.resolve(queue)?;
        let mut shutdown = self.shared.shutdown.subscribe();
        next_message(
            &self.shared.store,
            &self.shared.registry,
            queue,
            &mut shutdown,
            Some(Instant::now() + timeout),
        )
        .await
        .transpose()
    }

    /// Available messages of `queue`, without reserving them.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store is unavailable.
    pub fn peek(&self, queue: &QueueKey) -> Result<Vec<Message>> {
        self.shared.store.peek(queue)
    }

    /// Register a queue with optional subqueues.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQueueName` for an invalid name.
    pub fn create_queue(&self, name: &str, subqueues: &[String]) -> Result<()> {
        self.shared.registry.create(name, subqueues)
    }

    /// Registered queues.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the registry is unavailable.
    pub fn queues(&self) -> Result<Vec<String>> {
        self.shared.registry.queues()
    }

    /// Subqueues of `queue`.
    ///
    /// # Errors
    ///
    /// Returns `QueueNotFound` for an unregistered queue.
    pub fn subqueues(&self, queue: &str) -> Result<Vec<String>> {
        self.shared.registry.subqueues(queue)
    }

    /// Outgoing records still owed a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store is unavailable.
    pub fn pending_outgoing(&self) -> Result<Vec<OutgoingRecord>> {
        self.shared.store.pending_outgoing()
    }

    /// Outgoing records that will not be retried.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store is unavailable.
    pub fn failed_outgoing(&self) -> Result<Vec<OutgoingRecord>> {
        self.shared.store.failed_outgoing()
    }

    /// Wait until nothing remains to deliver. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store is unavailable.
    pub async fn wait_for_all_sent(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut events = self.shared.events.subscribe();
        loop {
            if !self.shared.store.has_pending_outgoing()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            // Events shorten the wait; the poll bound covers lag and missed ones.
            let step = (deadline - now).min(Duration::from_millis(50));
            let _ = tokio::time::timeout(step, events.recv()).await;
        }
    }

    /// Outcomes of outbound deliveries.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.shared.events.subscribe()
    }

    /// Stop accepting work, finish or abort in-flight deliveries, roll back
    /// open scopes and close the store.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailure` if the store cannot be closed cleanly.
    pub async fn stop(&self) -> Result<()> {
        if !self.shared.shutdown.trigger() {
            return Ok(());
        }
        tracing::info!(name = %self.shared.config.name, "Stopping queue manager");

        if let Some(tasks) = self.shared.tasks.lock().await.take() {
            if let Err(e) = tasks.listener.await {
                tracing::warn!(error = %e, "Listener task ended abnormally");
            }
            if let Err(e) = tasks.worker.await {
                tracing::warn!(error = %e, "Delivery worker ended abnormally");
            }
        }

        let deadline = Instant::now() + self.shared.config.shutdown_timeout();
        while self.shared.store.open_transactions()? > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.shared.store.close()?;

        tracing::info!(name = %self.shared.config.name, "Queue manager stopped");
        Ok(())
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("name", &self.shared.config.name)
            .field("endpoint", &self.shared.endpoint)
            .finish_non_exhaustive()
    }
}
