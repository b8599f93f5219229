//! # SQLite History Store
//!
//! Chats and text messages observed by the relay. Both tables are written
//! with upserts so replayed events and history backfill never duplicate rows.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::schema;
use crate::error::{Error, Result};
use crate::time::from_millis;

/// A conversation row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub jid: String,
    pub name: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
}

/// A stored text message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
}

/// Local history database.
///
/// Cheap to clone; all clones share one connection. SQLite serializes
/// writers, so live events and history sync may upsert concurrently.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(p) => {
                let conn = Connection::open(p)
                    .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?;
                conn.pragma_update(None, "journal_mode", "WAL")
                    .map_err(|e| Error::DatabaseError(format!("Failed to enable WAL: {}", e)))?;
                conn
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| Error::DatabaseError(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("History schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) => {
                tracing::debug!("History schema version: {}", v);
            }
        }

        Ok(())
    }

    // ========================================================================
    // CHAT OPERATIONS
    // ========================================================================

    /// Insert or overwrite a chat row.
    ///
    /// Always overwrites: callers pass the latest known name and time.
    pub fn upsert_chat(&self, jid: &str, name: &str, last_message_time: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time) VALUES (?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
                name = excluded.name,
                last_message_time = excluded.last_message_time",
            params![jid, name, last_message_time.timestamp_millis()],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store chat: {}", e)))?;
        Ok(())
    }

    /// Upsert a chat seen with a message at `message_time`.
    ///
    /// The name is overwritten, the last message time only ever moves
    /// forward. Used by event intake, where older messages (history sync,
    /// late deliveries) routinely arrive after newer ones.
    pub fn record_chat_activity(
        &self,
        jid: &str,
        name: &str,
        message_time: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time) VALUES (?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
                name = excluded.name,
                last_message_time = MAX(
                    COALESCE(last_message_time, excluded.last_message_time),
                    excluded.last_message_time
                )",
            params![jid, name, message_time.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Record a resolved name without touching the last message time.
    pub fn store_chat_name(&self, jid: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chats (jid, name) VALUES (?, ?)
             ON CONFLICT(jid) DO UPDATE SET name = excluded.name",
            params![jid, name],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store chat name: {}", e)))?;
        Ok(())
    }

    /// Cached display name of a chat. Empty names read as `None`.
    pub fn get_chat_name(&self, jid: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let name: Option<Option<String>> = conn
            .query_row("SELECT name FROM chats WHERE jid = ?", params![jid], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get chat name: {}", e)))?;
        Ok(name.flatten().filter(|n| !n.is_empty()))
    }

    /// All chats, most recently active first.
    pub fn get_chats(&self) -> Result<Vec<ChatRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT jid, name, last_message_time FROM chats
                 ORDER BY last_message_time DESC",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let last: Option<i64> = row.get(2)?;
                Ok(ChatRecord {
                    jid: row.get(0)?,
                    name: row.get(1)?,
                    last_message_time: last.map(from_millis),
                })
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query chats: {}", e)))?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read chat: {}", e)))?);
        }
        Ok(chats)
    }

    pub fn chat_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chats", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // MESSAGE OPERATIONS
    // ========================================================================

    /// Insert or replace a message keyed by `(id, chat_jid)`.
    ///
    /// Messages with empty content are not persisted; returns whether a row
    /// was written.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_message(
        &self,
        id: &str,
        chat_jid: &str,
        sender: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        is_from_me: bool,
    ) -> Result<bool> {
        if content.is_empty() {
            return Ok(false);
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, chat_jid, sender, content, timestamp, is_from_me)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id, chat_jid) DO UPDATE SET
                sender = excluded.sender,
                content = excluded.content,
                timestamp = excluded.timestamp,
                is_from_me = excluded.is_from_me",
            params![
                id,
                chat_jid,
                sender,
                content,
                timestamp.timestamp_millis(),
                is_from_me as i32,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store message: {}", e)))?;
        Ok(true)
    }

    /// Messages of one chat, newest first, at most `limit`.
    pub fn get_messages(&self, chat_jid: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_jid, sender, content, timestamp, is_from_me
                 FROM messages WHERE chat_jid = ?
                 ORDER BY timestamp DESC LIMIT ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![chat_jid, limit as i64], |row| {
                Ok(MessageRecord {
                    id: row.get(0)?,
                    chat_jid: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: from_millis(row.get(4)?),
                    is_from_me: row.get::<_, i32>(5)? != 0,
                })
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?,
            );
        }
        Ok(messages)
    }

    pub fn message_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| Error::DatabaseError(e.to_string()))?;
        Ok(count as usize)
    }
}

// ============================================================================
// TESTS
// ============================================================================
