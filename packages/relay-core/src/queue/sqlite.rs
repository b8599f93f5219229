//! SQLite-backed relay queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tokio::sync::Notify;

use super::{DeadLetter, QueueBackend, ReceivedEntry};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::time::{from_millis, now_timestamp_millis};

/// Recheck period while long-polling an empty queue.
const RECHECK_INTERVAL: Duration = Duration::from_millis(250);

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    body TEXT NOT NULL,
    sent_at INTEGER NOT NULL,
    visible_at INTEGER NOT NULL,
    receipt TEXT,
    receive_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_entries(queue, visible_at);
CREATE INDEX IF NOT EXISTS idx_queue_receipt ON queue_entries(receipt);

CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    body TEXT NOT NULL,
    receive_count INTEGER NOT NULL,
    sent_at INTEGER NOT NULL,
    dead_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_queue ON dead_letters(queue, dead_at DESC);
"#;

/// Durable queue in a SQLite file.
///
/// Several named queues may share one file. Cloning shares the connection
/// and the wake-up signal.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
    name: String,
    visibility_timeout: Duration,
    max_receives: u32,
}

impl SqliteQueue {
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| {
                    Error::QueueUnavailable(format!("Failed to open queue database: {}", e))
                })?;
                conn.pragma_update(None, "journal_mode", "WAL")
                    .map_err(|e| Error::QueueUnavailable(format!("Failed to enable WAL: {}", e)))?;
                conn
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::QueueUnavailable(format!("Failed to create in-memory queue: {}", e))
            })?,
        };
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::QueueUnavailable(format!("Failed to set busy timeout: {}", e)))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| Error::QueueUnavailable(format!("Failed to create queue tables: {}", e)))?;

        tracing::info!(
            queue = %config.name,
            visibility_timeout_secs = config.visibility_timeout.as_secs(),
            max_receives = config.max_receives,
            "Queue opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
            name: config.name.clone(),
            visibility_timeout: config.visibility_timeout,
            max_receives: config.max_receives,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim visible entries without waiting.
    ///
    /// Entries that already used up their receives are dead-lettered first.
    fn claim(&self, max: usize) -> Result<Vec<ReceivedEntry>> {
        let now = now_timestamp_millis();
        let visible_until = now + self.visibility_timeout.as_millis() as i64;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

        let dead = tx
            .execute(
                "INSERT INTO dead_letters (id, queue, body, receive_count, sent_at, dead_at)
                 SELECT id, queue, body, receive_count, sent_at, ?1 FROM queue_entries
                 WHERE queue = ?2 AND visible_at <= ?1 AND receive_count >= ?3",
                params![now, self.name, self.max_receives],
            )
            .map_err(|e| Error::QueueUnavailable(format!("Failed to dead-letter: {}", e)))?;
        if dead > 0 {
            tx.execute(
                "DELETE FROM queue_entries
                 WHERE queue = ?1 AND visible_at <= ?2 AND receive_count >= ?3",
                params![self.name, now, self.max_receives],
            )
            .map_err(|e| Error::QueueUnavailable(format!("Failed to dead-letter: {}", e)))?;
            tracing::warn!(
                queue = %self.name,
                count = dead,
                max_receives = self.max_receives,
                "Entries moved to dead letters"
            );
        }

        let candidates: Vec<(String, String, u32)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, body, receive_count FROM queue_entries
                     WHERE queue = ? AND visible_at <= ?
                     ORDER BY sent_at, rowid LIMIT ?",
                )
                .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
            let rows = stmt
                .query_map(params![self.name, now, max as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
            let collected: std::result::Result<Vec<_>, _> = rows.collect();
            collected.map_err(|e| Error::QueueUnavailable(e.to_string()))?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, body, receive_count) in candidates {
            let receipt = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE queue_entries
                 SET receipt = ?, visible_at = ?, receive_count = receive_count + 1
                 WHERE id = ?",
                params![receipt, visible_until, id],
            )
            .map_err(|e| Error::QueueUnavailable(format!("Failed to claim entry: {}", e)))?;
            claimed.push(ReceivedEntry {
                id,
                receipt,
                body,
                receive_count: receive_count + 1,
            });
        }

        tx.commit()
            .map_err(|e| Error::QueueUnavailable(format!("Failed to commit claim: {}", e)))?;
        Ok(claimed)
    }

    /// Most recent dead letters of this queue.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, body, receive_count, sent_at, dead_at FROM dead_letters
                 WHERE queue = ? ORDER BY dead_at DESC LIMIT ?",
            )
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map(params![self.name, limit as i64], |row| {
                Ok(DeadLetter {
                    id: row.get(0)?,
                    body: row.get(1)?,
                    receive_count: row.get(2)?,
                    sent_at: from_millis(row.get(3)?),
                    dead_at: from_millis(row.get(4)?),
                })
            })
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        let dead: std::result::Result<Vec<_>, _> = rows.collect();
        dead.map_err(|e| Error::QueueUnavailable(e.to_string()))
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE queue = ?",
                params![self.name],
                |row| row.get(0),
            )
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn send(&self, body: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_timestamp_millis();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO queue_entries (id, queue, body, sent_at, visible_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![id, self.name, body, now, now],
            )
            .map_err(|e| Error::QueueUnavailable(format!("Failed to send: {}", e)))?;
        }
        self.notify.notify_waiters();
        tracing::debug!(queue = %self.name, id = %id, "Entry sent");
        Ok(id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedEntry>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let entries = self.claim(max)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let recheck = RECHECK_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(recheck) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM queue_entries WHERE queue = ? AND receipt = ?",
                params![self.name, receipt],
            )
            .map_err(|e| Error::QueueUnavailable(format!("Failed to delete: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn depth(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE queue = ?",
                params![self.name],
                |row| row.get(0),
            )
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        Ok(count as usize)
    }
}
