//! # Relay Queue
//!
//! Durable, at-least-once hand-off between event intake and backend delivery.
//!
//! ```text
//!   Producer ──send──► ┌──────────────┐ ──receive──► Consumer ──► Delivery
//!                      │ QueueBackend │                 │
//!                      └──────────────┘ ◄──delete────────┘ (only on success)
//! ```
//!
//! A received entry stays hidden for the visibility timeout; if it is not
//! deleted by then it becomes receivable again. Entries received more than
//! `max_receives` times are moved to the dead-letter table instead of being
//! handed out again.

mod consumer;
mod producer;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

pub use consumer::{ConsumerStats, CycleReport, Delivery, QueueConsumer};
pub use producer::Producer;
pub use sqlite::SqliteQueue;

/// An entry handed out by [`QueueBackend::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEntry {
    pub id: String,
    /// Handle for deleting this delivery. Changes on every receive.
    pub receipt: String,
    pub body: String,
    /// How many times the entry has been received, this one included.
    pub receive_count: u32,
}

/// An entry that exhausted its receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub body: String,
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
}

/// Durable queue operations the relay depends on.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Submit a body; returns the entry id.
    async fn send(&self, body: &str) -> Result<String>;

    /// Claim up to `max` visible entries, waiting at most `wait` for one to
    /// appear.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedEntry>>;

    /// Acknowledge a delivery. Returns false when the receipt is stale
    /// (the entry was redelivered or already deleted).
    async fn delete(&self, receipt: &str) -> Result<bool>;

    /// Entries currently held, visible or in flight.
    async fn depth(&self) -> Result<usize>;
}
