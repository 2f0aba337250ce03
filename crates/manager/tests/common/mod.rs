//! Shared fixtures for queue manager integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use quay_core::QueueKey;
use quay_manager::{QueueManager, QueueManagerConfig, Received};

/// Upper bound for anything that should happen "soon".
pub const SOON: Duration = Duration::from_secs(10);

/// Config bound to an OS-assigned port with short retry timings.
pub fn fast_config(name: &str) -> QueueManagerConfig {
    let mut config = QueueManagerConfig::new(name).with_port(0);
    config.delivery.base_backoff_ms = 20;
    config.delivery.max_backoff_ms = 200;
    config.delivery.poll_interval_ms = 50;
    config.delivery.connect_timeout_ms = 1_000;
    config.delivery.ack_timeout_ms = 2_000;
    config.shutdown_timeout_ms = 1_000;
    config
}

pub async fn start(name: &str) -> QueueManager {
    start_with(fast_config(name)).await
}

pub async fn start_with(config: QueueManagerConfig) -> QueueManager {
    QueueManager::start(config)
        .await
        .expect("queue manager should start")
}

pub fn queue(name: &str) -> QueueKey {
    QueueKey::new(name).unwrap()
}

/// Receive one message or fail the test after [`SOON`].
pub async fn receive_soon(manager: &QueueManager, queue: &QueueKey) -> Received {
    manager
        .receive(queue, SOON)
        .await
        .expect("receive should not fail")
        .expect("a message should arrive")
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
