//! Shared server state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;

use relay_core::pipeline::PipelineStats;
use relay_core::queue::ConsumerStats;
use relay_core::{EventPipeline, FileBlobStore, QueueBackend, SqliteQueue};

/// Handles every route needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: EventPipeline,
    pub queue: Arc<SqliteQueue>,
    pub blobs: FileBlobStore,
    pub consumer: Arc<ConsumerStats>,
    pub started_at: i64,
}

/// Snapshot served by `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub queue: String,
    pub queue_depth: usize,
    pub dead_letters: usize,
    pub chats: usize,
    pub messages: usize,
    pub blobs: usize,
    pub connected: bool,
    pub events_received: u64,
    pub envelopes_enqueued: u64,
    pub enqueue_failures: u64,
    pub history_messages: u64,
    pub delivered: u64,
    pub retained: u64,
    pub malformed: u64,
    pub uptime_secs: i64,
}

impl AppState {
    pub fn new(
        pipeline: EventPipeline,
        queue: Arc<SqliteQueue>,
        blobs: FileBlobStore,
        consumer: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            pipeline,
            queue,
            blobs,
            consumer,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Collect counters. Storage errors read as zero.
    pub async fn stats(&self) -> StatsSnapshot {
        let db = self.pipeline.database();
        let pipeline: &PipelineStats = self.pipeline.stats();
        StatsSnapshot {
            queue: self.queue.name().to_string(),
            queue_depth: self.queue.depth().await.unwrap_or(0),
            dead_letters: self.queue.dead_letter_count().unwrap_or(0),
            chats: db.chat_count().unwrap_or(0),
            messages: db.message_count().unwrap_or(0),
            blobs: self.blobs.len(),
            connected: pipeline.connected.load(Ordering::Relaxed),
            events_received: pipeline.messages.load(Ordering::Relaxed),
            envelopes_enqueued: pipeline.enqueued.load(Ordering::Relaxed),
            enqueue_failures: pipeline.enqueue_failures.load(Ordering::Relaxed),
            history_messages: pipeline.history_messages.load(Ordering::Relaxed),
            delivered: self.consumer.delivered.load(Ordering::Relaxed),
            retained: self.consumer.retained.load(Ordering::Relaxed),
            malformed: self.consumer.malformed.load(Ordering::Relaxed),
            uptime_secs: chrono::Utc::now().timestamp() - self.started_at,
        }
    }
}
