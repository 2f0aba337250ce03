//! Inbound side of the delivery protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quay_core::Error;
use quay_store::QueueStore;
use quay_wire::{DeliveryBatch, Status, WireTransport};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::registry::QueueRegistry;
use crate::shutdown::ShutdownListener;

/// Accept loop; every connection carries one batch.
pub(crate) struct Listener {
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    shutdown: ShutdownListener,
    drain_timeout: Duration,
}

pub(crate) struct ListenerContext {
    pub(crate) store: Arc<QueueStore>,
    pub(crate) registry: Arc<QueueRegistry>,
    pub(crate) read_timeout: Duration,
}

impl Listener {
    pub(crate) fn new(
        listener: TcpListener,
        ctx: ListenerContext,
        shutdown: ShutdownListener,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            ctx: Arc::new(ctx),
            shutdown,
            drain_timeout,
        }
    }

    pub(crate) async fn run(mut self) {
        let local = self.listener.local_addr().ok();
        tracing::info!(address = ?local, "Listener started");
        let mut connections = JoinSet::new();

        loop {
            while connections.try_join_next().is_some() {}
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(Arc::clone(&self.ctx), stream, peer));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                () = self.shutdown.wait() => break,
            }
        }
        drop(self.listener);

        if !connections.is_empty() {
            let open = connections.len();
            let drained = timeout(self.drain_timeout, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(open, "Inbound connections still open at shutdown, aborting");
                connections.shutdown().await;
            }
        }
        tracing::info!(address = ?local, "Listener stopped");
    }
}

async fn handle_connection(ctx: Arc<ListenerContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let mut transport = WireTransport::new(stream);

    let batch = match timeout(ctx.read_timeout, transport.recv_batch()).await {
        Ok(Ok(batch)) => batch,
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Protocol violation, dropping connection");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "Peer did not send a batch in time");
            return;
        }
    };

    let transaction_id = batch.transaction_id;
    let status = accept_batch(&ctx, batch);
    if let Err(e) = transport.send_status(status).await {
        tracing::warn!(peer = %peer, transaction_id = %transaction_id, error = %e, "Sending reply failed");
    }
}

/// Persist a batch and choose the reply.
pub(crate) fn accept_batch(ctx: &ListenerContext, batch: DeliveryBatch) -> Status {
    for message in &batch.messages {
        match ctx.registry.resolve(&message.queue) {
            Ok(()) => {}
            Err(Error::QueueNotFound { queue }) => {
                tracing::warn!(transaction_id = %batch.transaction_id, queue = %queue, "Batch names an unknown queue");
                return Status::UnknownQueue;
            }
            Err(e) => {
                tracing::error!(transaction_id = %batch.transaction_id, error = %e, "Queue lookup failed");
                return Status::Reverted;
            }
        }
    }

    let (transaction_id, messages) = batch.into_arrived(Utc::now());
    match ctx.store.persist_incoming(transaction_id, messages) {
        Ok(_) => Status::Acknowledged,
        Err(e) => {
            tracing::error!(transaction_id = %transaction_id, error = %e, "Persisting batch failed, reverting");
            Status::Reverted
        }
    }
}
