//! # Database Schema
//!
//! SQL schema for the local chat history.
//!
//! ```text
//! ┌─────────────────────┐        ┌─────────────────────┐
//! │        chats        │        │      messages       │
//! ├─────────────────────┤        ├─────────────────────┤
//! │ jid (PK)            │◄───────│ chat_jid  ┐ (PK)    │
//! │ name                │        │ id        ┘         │
//! │ last_message_time   │        │ sender              │
//! └─────────────────────┘        │ content             │
//!                                │ timestamp           │
//!                                │ is_from_me          │
//!                                └─────────────────────┘
//! ```
//!
//! Timestamps are Unix milliseconds.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Chats table
-- One row per conversation; name is the resolved display name
CREATE TABLE IF NOT EXISTS chats (
    jid TEXT PRIMARY KEY,
    name TEXT,
    last_message_time INTEGER
);
CREATE INDEX IF NOT EXISTS idx_chats_last_message ON chats(last_message_time DESC);

-- Messages table
-- Text messages only; (id, chat_jid) is the identity, replays overwrite
CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    chat_jid TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_from_me INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, chat_jid)
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_time ON messages(chat_jid, timestamp DESC);
"#;
