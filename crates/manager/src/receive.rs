//! Streaming receive over a local queue.

use std::sync::Arc;

use futures::Stream;
use quay_core::{Error, Message, QueueKey, Result};
use quay_store::QueueStore;
use tokio::time::Instant;

use crate::registry::QueueRegistry;
use crate::scope::TransactionalScope;
use crate::shutdown::ShutdownListener;

/// A dequeued message and the scope that holds it.
///
/// Commit the scope to remove the message for good; roll it back, or drop
/// it, to return the message to the queue.
#[derive(Debug)]
pub struct Received {
    pub message: Message,
    pub scope: TransactionalScope,
}

/// Lazy, unbounded sequence of messages from one queue partition.
///
/// Any number of streams may consume the same queue; each message is handed
/// to exactly one of them. The stream ends when the manager shuts down.
pub struct ReceiveStream {
    queue: QueueKey,
    store: Arc<QueueStore>,
    registry: Arc<QueueRegistry>,
    shutdown: ShutdownListener,
}

impl ReceiveStream {
    pub(crate) const fn new(
        queue: QueueKey,
        store: Arc<QueueStore>,
        registry: Arc<QueueRegistry>,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            shutdown,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &QueueKey {
        &self.queue
    }

    /// Wait for the next message. `None` once the manager is shutting down.
    pub async fn next(&mut self) -> Option<Result<Received>> {
        next_message(&self.store, &self.registry, &self.queue, &mut self.shutdown, None).await
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Received>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

/// Block until a message of `queue` can be reserved, shutdown, or `deadline`.
pub(crate) async fn next_message(
    store: &Arc<QueueStore>,
    registry: &Arc<QueueRegistry>,
    queue: &QueueKey,
    shutdown: &mut ShutdownListener,
    deadline: Option<Instant>,
) -> Option<Result<Received>> {
    if shutdown.is_shutdown() {
        return None;
    }
    let scope = match TransactionalScope::begin(Arc::clone(store), Arc::clone(registry)) {
        Ok(scope) => scope,
        Err(Error::ShutDown) => return None,
        Err(e) => return Some(Err(e)),
    };

    loop {
        let notified = store.incoming_signal().notified();
        tokio::pin!(notified);
        // Register before checking so an arrival between the check and the
        // wait is not missed.
        notified.as_mut().enable();

        match scope.try_receive(queue) {
            Ok(Some(message)) => return Some(Ok(Received { message, scope })),
            Ok(None) => {}
            Err(Error::ShutDown) => return None,
            Err(e) => return Some(Err(e)),
        }

        tokio::select! {
            () = &mut notified => {}
            () = shutdown.wait() => return None,
            () = sleep_until(deadline) => return None,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
