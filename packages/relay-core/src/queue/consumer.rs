//! Queue consumer loop.
//!
//! ```text
//!   Idle ──► Polling ──► Dispatching ──► Deleting | Retained ──► Idle
//!              │ (empty)                                      ▲
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! An entry is deleted only when its delivery reports success. Failed and
//! undecodable entries are left alone and come back after the visibility
//! timeout, until the backend dead-letters them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{QueueBackend, ReceivedEntry};
use crate::config::PollerConfig;
use crate::envelope::QueueEnvelope;
use crate::error::Result;

/// Delivers one envelope to its destination.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, envelope: &QueueEnvelope) -> Result<()>;
}

/// Outcome counts of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub delivered: usize,
    pub retained: usize,
    pub malformed: usize,
}

/// Running totals across cycles.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub cycles: AtomicU64,
    pub delivered: AtomicU64,
    pub retained: AtomicU64,
    pub malformed: AtomicU64,
}

impl ConsumerStats {
    fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.retained.fetch_add(report.retained as u64, Ordering::Relaxed);
        self.malformed
            .fetch_add(report.malformed as u64, Ordering::Relaxed);
    }
}

enum Outcome {
    Delivered,
    Retained,
    Malformed,
}

/// The single consumer of the relay queue.
pub struct QueueConsumer {
    queue: Arc<dyn QueueBackend>,
    delivery: Arc<dyn Delivery>,
    config: PollerConfig,
    stats: Arc<ConsumerStats>,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        delivery: Arc<dyn Delivery>,
        config: PollerConfig,
    ) -> Self {
        Self {
            queue,
            delivery,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Run the loop on its own task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Poll, dispatch, sleep; repeat until cancelled.
    ///
    /// Cancellation interrupts the long-poll and the sleep. A batch already
    /// fetched is always finished.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            wait_secs = self.config.wait.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Queue consumer started"
        );

        while !cancel.is_cancelled() {
            match self.run_cycle(&cancel).await {
                Ok(report) if report.fetched > 0 => {
                    tracing::info!(
                        fetched = report.fetched,
                        delivered = report.delivered,
                        retained = report.retained,
                        malformed = report.malformed,
                        "Poll cycle complete"
                    );
                }
                Ok(_) => tracing::trace!("Poll cycle found nothing"),
                Err(e) => tracing::warn!(error = %e, "Poll cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("Queue consumer stopped");
    }

    /// One Polling → Dispatching pass.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let entries = tokio::select! {
            _ = cancel.cancelled() => return Ok(CycleReport::default()),
            received = self.queue.receive(self.config.batch_size, self.config.wait) => received?,
        };

        let mut report = CycleReport {
            fetched: entries.len(),
            ..CycleReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let outcomes = join_all(entries.iter().map(|entry| self.dispatch(entry))).await;
        for outcome in outcomes {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Retained => report.retained += 1,
                Outcome::Malformed => report.malformed += 1,
            }
        }

        self.stats.record(&report);
        Ok(report)
    }

    async fn dispatch(&self, entry: &ReceivedEntry) -> Outcome {
        let envelope = match QueueEnvelope::decode(&entry.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    receive_count = entry.receive_count,
                    error = %e,
                    "Leaving undecodable entry in queue"
                );
                return Outcome::Malformed;
            }
        };

        if let Err(e) = self.delivery.deliver(&envelope).await {
            tracing::warn!(
                entry_id = %entry.id,
                kind = %envelope.kind,
                message_id = %envelope.message_id,
                receive_count = entry.receive_count,
                recoverable = e.is_recoverable(),
                error = %e,
                "Delivery failed, entry retained"
            );
            return Outcome::Retained;
        }

        match self.queue.delete(&entry.receipt).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                entry_id = %entry.id,
                "Receipt went stale before delete; entry will be delivered again"
            ),
            Err(e) => tracing::warn!(entry_id = %entry.id, error = %e, "Failed to delete entry"),
        }
        tracing::debug!(entry_id = %entry.id, kind = %envelope.kind, "Entry delivered");
        Outcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::Error;
    use crate::queue::SqliteQueue;
    use crate::time::from_millis;

    /// Answers from a script, then succeeds.
    #[derive(Default)]
    struct ScriptedDelivery {
        script: Mutex<VecDeque<Result<()>>>,
        seen: Mutex<Vec<QueueEnvelope>>,
    }

    impl ScriptedDelivery {
        fn failing_first(n: usize) -> Self {
            let script = (0..n)
                .map(|_| Err(Error::BackendRejected { status: 500 }))
                .collect();
            Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Delivery for ScriptedDelivery {
        async fn deliver(&self, envelope: &QueueEnvelope) -> Result<()> {
            self.seen.lock().push(envelope.clone());
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn poller() -> PollerConfig {
        PollerConfig {
            batch_size: 10,
            wait: Duration::ZERO,
            interval: Duration::from_millis(10),
        }
    }

    fn queue(visibility_ms: u64) -> Arc<SqliteQueue> {
        Arc::new(
            SqliteQueue::open(&QueueConfig {
                visibility_timeout: Duration::from_millis(visibility_ms),
                ..QueueConfig::default()
            })
            .unwrap(),
        )
    }

    async fn send_text(queue: &SqliteQueue, body: &str) {
        let envelope = QueueEnvelope::text("+1555", "+1777", body, from_millis(1_000));
        queue.send(&envelope.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_success_deletes_entry() {
        let queue = queue(30_000);
        send_text(&queue, "hi").await;
        let delivery = Arc::new(ScriptedDelivery::default());
        let consumer = QueueConsumer::new(queue.clone(), delivery.clone(), poller());

        let report = consumer.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(delivery.seen.lock()[0].body, "hi");
    }

    #[tokio::test]
    async fn test_failure_retains_then_redelivers() {
        let queue = queue(0);
        send_text(&queue, "retry").await;
        let delivery = Arc::new(ScriptedDelivery::failing_first(1));
        let consumer = QueueConsumer::new(queue.clone(), delivery.clone(), poller());
        let cancel = CancellationToken::new();

        let first = consumer.run_cycle(&cancel).await.unwrap();
        assert_eq!(first.retained, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);

        let second = consumer.run_cycle(&cancel).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(delivery.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_batch() {
        let queue = queue(30_000);
        for body in ["a", "b", "c"] {
            send_text(&queue, body).await;
        }
        let delivery = Arc::new(ScriptedDelivery::failing_first(1));
        let consumer = QueueConsumer::new(queue.clone(), delivery, poller());

        let report = consumer.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.retained, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_left_in_queue() {
        let queue = queue(30_000);
        queue.send("{not an envelope").await.unwrap();
        let delivery = Arc::new(ScriptedDelivery::default());
        let consumer = QueueConsumer::new(queue.clone(), delivery.clone(), poller());

        let report = consumer.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
        assert!(delivery.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_loop() {
        let queue = queue(30_000);
        let consumer = QueueConsumer::new(
            queue,
            Arc::new(ScriptedDelivery::default()),
            PollerConfig {
                batch_size: 10,
                wait: Duration::from_secs(5),
                interval: Duration::from_secs(10),
            },
        );
        let stats = consumer.stats();
        let cancel = CancellationToken::new();
        let handle = consumer.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer did not stop")
            .unwrap();
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 0);
    }
}
