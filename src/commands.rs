//! CLI command handlers.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use quay_core::{Destination, MessagePayload, QueueKey};
use quay_manager::{DeliveryEvent, QueueManager, QueueManagerConfig};
use quay_store::{JOURNAL_FILE, MemoryJournal, OutgoingRecord, QueueStore, StoreOptions};

use crate::cli::Commands;

/// Execute a CLI command.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { config, queue } => cmd_serve(&config, queue).await,
        Commands::Send {
            config,
            destination,
            data,
            headers,
            wait_secs,
        } => cmd_send(&config, &destination, data, headers, wait_secs).await,
        Commands::Inspect { storage } => cmd_inspect(&storage),
    }
}

fn load_config(path: &Path) -> Result<QueueManagerConfig> {
    QueueManagerConfig::from_file(path)
        .with_context(|| format!("Failed to load queue manager config from {}", path.display()))
}

async fn cmd_serve(config: &Path, queue: Option<String>) -> Result<()> {
    let manager = QueueManager::start(load_config(config)?)
        .await
        .context("Failed to start queue manager")?;
    info!(endpoint = %manager.local_endpoint(), "Queue manager running, press Ctrl+C to stop");

    let mut events = manager.subscribe_events();
    let receiving = match queue {
        Some(name) => {
            let key = QueueKey::new(name)?;
            Some(tokio::spawn(log_incoming(manager.clone(), key)))
        }
        None => None,
    };

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(DeliveryEvent::Failed { batch_id, endpoint, error, .. }) => {
                    warn!(batch_id = %batch_id, endpoint = %endpoint, error = %error, "Batch failed permanently");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Delivery event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    manager.stop().await.context("Queue manager did not stop cleanly")?;
    if let Some(handle) = receiving {
        handle.await.context("Receive task panicked")??;
    }
    Ok(())
}

async fn log_incoming(manager: QueueManager, queue: QueueKey) -> Result<()> {
    let mut stream = Box::pin(manager.receive_stream(&queue)?.into_stream());
    while let Some(received) = stream.next().await {
        let received = received?;
        info!(
            queue = %received.message.queue,
            message_id = %received.message.id,
            bytes = received.message.data.len(),
            body = %String::from_utf8_lossy(&received.message.data),
            "Message received"
        );
        received.scope.commit()?;
    }
    Ok(())
}

async fn cmd_send(
    config: &Path,
    destination: &str,
    data: String,
    headers: Vec<(String, String)>,
    wait_secs: u64,
) -> Result<()> {
    let destination = Destination::parse(destination)
        .with_context(|| format!("Invalid destination '{destination}'"))?;
    let payload = headers
        .into_iter()
        .fold(MessagePayload::new(data), |payload, (key, value)| {
            payload.with_header(key, value)
        });

    let manager = QueueManager::start(load_config(config)?)
        .await
        .context("Failed to start queue manager")?;
    let message_id = manager.send(&destination, payload)?;
    info!(message_id = %message_id, destination = %destination, "Message queued");

    let delivered = manager
        .wait_for_all_sent(Duration::from_secs(wait_secs))
        .await?;
    let failed = manager.failed_outgoing()?;
    manager.stop().await?;

    if !failed.is_empty() {
        bail!("Delivery to {destination} failed permanently");
    }
    if !delivered {
        bail!("Message {message_id} still queued after {wait_secs}s; it stays in the store for the next run");
    }
    println!("{message_id}");
    Ok(())
}

#[derive(Serialize)]
struct StoreReport {
    queues: BTreeMap<String, usize>,
    outgoing: Vec<OutgoingRecord>,
}

fn cmd_inspect(storage: &Path) -> Result<()> {
    let store = open_read_only(storage)?;
    let report = StoreReport {
        queues: store
            .queue_depths()?
            .into_iter()
            .map(|(queue, depth)| (queue.to_string(), depth))
            .collect(),
        outgoing: store
            .pending_outgoing()?
            .into_iter()
            .chain(store.failed_outgoing()?)
            .collect(),
    };
    store.close()?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Replay a store's journal into memory, leaving the directory untouched.
fn open_read_only(storage: &Path) -> Result<QueueStore> {
    let path = storage.join(JOURNAL_FILE);
    if !path.is_file() {
        bail!("No message store at {}", storage.display());
    }
    let bytes = std::fs::read(&path)
        .with_context(|| format!("Failed to read journal {}", path.display()))?;
    let journal = MemoryJournal::from_bytes(bytes);
    QueueStore::with_journal(Box::new(journal), StoreOptions::default())
        .with_context(|| format!("Failed to replay journal {}", path.display()))
}
