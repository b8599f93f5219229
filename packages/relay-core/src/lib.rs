//! # Relay Core
//!
//! Relays chat events from a live messaging session to a remote audit-log
//! backend while keeping a durable local history.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RELAY PIPELINE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ProtocolEvent                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────┐   text    ┌─────────────┐   ┌──────────────────────────┐  │
//! │  │ Classify │ ────────► │ Chat Names  │──►│ Storage (chats/messages) │  │
//! │  └────┬─────┘           └─────────────┘   └──────────────────────────┘  │
//! │       │ envelopes                                                       │
//! │       ▼                                                                 │
//! │  ┌──────────┐  media  ┌──────────┐                                      │
//! │  │ Producer │ ──────► │   Blob   │                                      │
//! │  └────┬─────┘         └──────────┘                                      │
//! │       │ send                                                            │
//! │       ▼                                                                 │
//! │  ┌──────────┐ receive ┌──────────┐  POST  ┌──────────────────────┐      │
//! │  │  Queue   │ ──────► │ Consumer │ ─────► │ Forwarder ─► backend │      │
//! │  └──────────┘ ◄────── └──────────┘        └──────────────────────┘      │
//! │                delete (on 200 only)                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the whole relay
//! - [`config`] - Configuration sections built once at startup
//! - [`protocol`] - Messaging-protocol boundary (events, JIDs, `ChatProtocol`)
//! - [`storage`] - Local chat history (SQLite)
//! - [`names`] - Chat display-name resolution
//! - [`classify`] - Event classification into history rows and envelopes
//! - [`envelope`] - The queued unit of work
//! - [`blob`] - Media object store
//! - [`queue`] - Durable queue, producer and consumer loop
//! - [`forwarder`] - Authenticated multipart delivery to the backend
//! - [`pipeline`] - Ties classification to history and the queue
//!
//! ## Delivery Semantics
//!
//! At-least-once. An envelope is deleted from the queue only after the
//! backend answered 200; anything else leaves it for redelivery after the
//! visibility timeout. Entries that keep failing are dead-lettered after
//! `max_receives` attempts.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod blob;
pub mod classify;
pub mod config;
pub mod envelope;
pub mod error;
pub mod forwarder;
pub mod names;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod storage;
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use blob::{BlobStore, FileBlobStore};
pub use config::{
    BlobConfig, ForwarderConfig, GatewayConfig, PollerConfig, QueueConfig, RelayConfig,
};
pub use envelope::{EnvelopeKind, QueueEnvelope};
pub use error::{Error, Result};
pub use forwarder::Forwarder;
pub use pipeline::{EventPipeline, MessageOutcome, OutboundMedia};
pub use protocol::{ChatProtocol, Jid, ProtocolEvent};
pub use queue::{Delivery, Producer, QueueBackend, QueueConsumer, SqliteQueue};
pub use storage::Database;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
