//! Outbound delivery: drains committed batches to their endpoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use quay_core::{Endpoint, Error, Result};
use quay_store::{ClaimedBatch, QueueStore};
use quay_wire::{DeliveryBatch, Status, WireTransport};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::DeliveryConfig;
use crate::events::{DeliveryEvent, DeliveryEvents};
use crate::shutdown::ShutdownListener;

/// Exponential backoff: `base_ms * 2^attempt`, capped at `max_ms`.
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

/// When and whether to retry a failed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the next try after `attempts` failures, or `None` if exhausted.
    #[must_use]
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return None;
        }
        let delay = calculate_backoff(
            attempts.saturating_sub(1),
            self.base_backoff_ms,
            self.max_backoff_ms,
        );
        // Up to 10% jitter, never past the cap.
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
        let cap = Duration::from_millis(self.max_backoff_ms.max(1));
        Some((delay + Duration::from_millis(jitter_ms)).min(cap))
    }
}

/// Shared by the worker and every delivery it spawns.
pub(crate) struct DeliveryContext {
    pub(crate) store: Arc<QueueStore>,
    pub(crate) source: Endpoint,
    pub(crate) config: DeliveryConfig,
    pub(crate) policy: RetryPolicy,
    pub(crate) events: DeliveryEvents,
}

/// Single task that claims committed batches and delivers them concurrently.
pub(crate) struct DeliveryWorker {
    ctx: Arc<DeliveryContext>,
    shutdown: ShutdownListener,
    drain_timeout: Duration,
}

impl DeliveryWorker {
    pub(crate) fn new(
        ctx: DeliveryContext,
        shutdown: ShutdownListener,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            shutdown,
            drain_timeout,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(source = %self.ctx.source, "Delivery worker started");
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }
            if self.shutdown.is_shutdown() {
                break;
            }

            let capacity = self.ctx.config.max_in_flight.saturating_sub(in_flight.len());
            if capacity > 0 {
                match self.ctx.store.claim_outgoing(Utc::now(), capacity) {
                    Ok(batches) => {
                        for batch in batches {
                            in_flight.spawn(deliver(Arc::clone(&self.ctx), batch));
                        }
                    }
                    Err(Error::ShutDown) => break,
                    Err(e) => tracing::error!(error = %e, "Claiming outgoing batches failed"),
                }
            }

            let saturated = in_flight.len() >= self.ctx.config.max_in_flight;
            let idle = self.idle_time(saturated);
            let store = Arc::clone(&self.ctx.store);
            tokio::select! {
                () = store.outgoing_signal().notified() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
                () = tokio::time::sleep(idle) => {}
                () = self.shutdown.wait() => break,
            }
        }

        if !in_flight.is_empty() {
            let pending = in_flight.len();
            let drained = timeout(self.drain_timeout, async {
                while let Some(joined) = in_flight.join_next().await {
                    log_join(joined);
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(pending, "Deliveries still in flight at shutdown, aborting");
                in_flight.shutdown().await;
            }
        }
        match self.ctx.store.requeue_sending() {
            Ok(0) => {}
            Ok(requeued) => tracing::info!(requeued, "Aborted batches returned to queue"),
            Err(e) => tracing::warn!(error = %e, "Requeueing aborted batches failed"),
        }
        tracing::info!(source = %self.ctx.source, "Delivery worker stopped");
    }

    fn idle_time(&self, saturated: bool) -> Duration {
        let next_retry = self.ctx.store.next_retry_at().ok().flatten();
        idle_delay(self.ctx.config.poll_interval(), next_retry, Utc::now(), saturated)
    }
}

/// Sleep until the next scheduled retry, bounded by the poll interval.
///
/// A saturated worker cannot claim a due retry anyway, so it only wakes for
/// the poll interval, a finished delivery, new work or shutdown.
fn idle_delay(
    poll: Duration,
    next_retry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    saturated: bool,
) -> Duration {
    match next_retry {
        Some(at) if !saturated => (at - now).to_std().unwrap_or(Duration::ZERO).min(poll),
        _ => poll,
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Delivery task panicked");
        }
    }
}

/// One attempt at one batch, recording the outcome in the store.
pub(crate) async fn deliver(ctx: Arc<DeliveryContext>, batch: ClaimedBatch) {
    let attempt = batch.attempts.saturating_add(1);
    tracing::info!(
        batch_id = %batch.batch_id,
        endpoint = %batch.endpoint,
        count = batch.messages.len(),
        attempt,
        "Send attempted"
    );

    let message_ids = batch.messages.iter().map(|m| m.id).collect::<Vec<_>>();
    let error = match send_batch(&ctx, &batch).await {
        Ok(Status::Acknowledged) => {
            if let Err(e) = ctx.store.complete_batch(batch.batch_id) {
                tracing::error!(batch_id = %batch.batch_id, error = %e, "Recording acknowledgment failed, will resend");
                return;
            }
            tracing::info!(batch_id = %batch.batch_id, endpoint = %batch.endpoint, "Delivery acked");
            ctx.events.publish(DeliveryEvent::Delivered {
                batch_id: batch.batch_id,
                endpoint: batch.endpoint,
                message_ids,
            });
            return;
        }
        Ok(Status::UnknownQueue) => {
            let error = format!("{} does not host the target queue", batch.endpoint);
            give_up(&ctx, &batch, message_ids, error);
            return;
        }
        Ok(Status::Reverted) => format!("{} reverted the batch", batch.endpoint),
        Err(e) => e.to_string(),
    };

    match ctx.policy.next_delay(attempt) {
        Some(delay) => {
            let retry_at = retry_time(Utc::now(), delay);
            if let Err(e) = ctx.store.fail_batch(batch.batch_id, error.clone(), Some(retry_at)) {
                tracing::error!(batch_id = %batch.batch_id, error = %e, "Recording failed attempt failed, will retry");
                return;
            }
            tracing::warn!(
                batch_id = %batch.batch_id,
                endpoint = %batch.endpoint,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery failed"
            );
            ctx.events.publish(DeliveryEvent::Retrying {
                batch_id: batch.batch_id,
                endpoint: batch.endpoint,
                attempt,
                retry_in: delay,
                error,
            });
        }
        None => give_up(&ctx, &batch, message_ids, error),
    }
}

fn give_up(
    ctx: &DeliveryContext,
    batch: &ClaimedBatch,
    message_ids: Vec<quay_core::MessageId>,
    error: String,
) {
    if let Err(e) = ctx.store.fail_batch(batch.batch_id, error.clone(), None) {
        tracing::error!(batch_id = %batch.batch_id, error = %e, "Recording permanent failure failed, will retry");
        return;
    }
    tracing::error!(
        batch_id = %batch.batch_id,
        endpoint = %batch.endpoint,
        error = %error,
        "Delivery failed, giving up"
    );
    ctx.events.publish(DeliveryEvent::Failed {
        batch_id: batch.batch_id,
        endpoint: batch.endpoint.clone(),
        message_ids,
        error,
    });
}

async fn send_batch(ctx: &DeliveryContext, batch: &ClaimedBatch) -> Result<Status> {
    let endpoint = batch.endpoint.to_string();
    let stream = timeout(
        ctx.config.connect_timeout(),
        TcpStream::connect((batch.endpoint.host.as_str(), batch.endpoint.port)),
    )
    .await
    .map_err(|_| Error::connection(&endpoint, "connect timed out"))?
    .map_err(|e| Error::connection(&endpoint, e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let wire = DeliveryBatch::new(
        batch.batch_id,
        Some(ctx.source.clone()),
        batch.messages.clone(),
    );
    let mut transport = WireTransport::new(stream);
    let exchange = async {
        transport.send_batch(&wire).await?;
        transport.recv_status().await
    };
    let status = timeout(ctx.config.ack_timeout(), exchange)
        .await
        .map_err(|_| Error::connection(&endpoint, "no acknowledgment before timeout"))?
        .map_err(|e| match e {
            e if e.is_io() => Error::connection(&endpoint, e.to_string()),
            e => Error::from(e),
        })?;
    Ok(status)
}

fn retry_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(calculate_backoff(0, 100, 30_000), Duration::from_millis(100));
        assert_eq!(calculate_backoff(3, 100, 30_000), Duration::from_millis(800));
        assert_eq!(calculate_backoff(20, 100, 30_000), Duration::from_millis(30_000));
        assert_eq!(calculate_backoff(u32::MAX, 100, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn test_unbounded_policy_always_retries() {
        let policy = RetryPolicy::from_config(&DeliveryConfig::default());
        for attempts in [1, 10, 1_000] {
            let delay = policy.next_delay(attempts);
            assert!(delay.is_some_and(|d| d <= Duration::from_millis(30_000)));
        }
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let policy = RetryPolicy {
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            max_attempts: Some(2),
        };
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_none());
    }

    #[test]
    fn test_idle_waits_for_due_retry() {
        let poll = Duration::from_millis(1_000);
        let now = Utc::now();
        let soon = now + TimeDelta::milliseconds(200);
        assert_eq!(idle_delay(poll, Some(soon), now, false), Duration::from_millis(200));
        assert_eq!(idle_delay(poll, None, now, false), poll);
        assert_eq!(
            idle_delay(poll, Some(now + TimeDelta::seconds(60)), now, false),
            poll
        );
    }

    #[test]
    fn test_saturated_worker_does_not_spin_on_overdue_retry() {
        let poll = Duration::from_millis(1_000);
        let now = Utc::now();
        let overdue = now - TimeDelta::seconds(5);
        assert_eq!(idle_delay(poll, Some(overdue), now, false), Duration::ZERO);
        assert_eq!(idle_delay(poll, Some(overdue), now, true), poll);
    }

    #[test]
    fn test_jitter_stays_near_backoff() {
        let policy = RetryPolicy {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_attempts: None,
        };
        let delay = policy.next_delay(1).unwrap_or_default();
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay <= Duration::from_millis(1_100));
    }
}
