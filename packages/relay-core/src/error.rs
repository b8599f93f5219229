//! # Error Handling
//!
//! Error types for the relay pipeline.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Configuration (fatal at startup)                                  │
//! │  │   └── Config                - Missing credential / endpoint         │
//! │  │                                                                      │
//! │  ├── Storage (logged, never blocks the relay path)                     │
//! │  │   ├── DatabaseError         - SQLite failure                        │
//! │  │   └── BlobStoreError        - Object store write failure            │
//! │  │                                                                      │
//! │  ├── Queue                                                             │
//! │  │   ├── QueueUnavailable      - Backend rejected send/receive         │
//! │  │   └── MalformedEnvelope     - Body failed to deserialize            │
//! │  │                                                                      │
//! │  ├── Delivery (envelope retained for redelivery)                       │
//! │  │   ├── BlobFetchFailed       - Object store GET non-2xx              │
//! │  │   ├── BackendRejected       - Logging backend non-200               │
//! │  │   ├── Transport             - Network failure                       │
//! │  │   └── Timeout               - Bounded wait elapsed                  │
//! │  │                                                                      │
//! │  ├── Protocol                                                          │
//! │  │   ├── NotConnected          - Messaging session is down             │
//! │  │   └── ProtocolError         - Gateway call failed                   │
//! │  │                                                                      │
//! │  └── Validation                                                        │
//! │      └── Validation            - Bad command surface input             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors (100-199)
    // ========================================================================

    /// Required configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Storage Errors (200-299)
    // ========================================================================

    /// Local history database failure
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Blob object store failure
    #[error("Blob store error: {0}")]
    BlobStoreError(String),

    // ========================================================================
    // Queue Errors (300-399)
    // ========================================================================

    /// The queue backend rejected an operation
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A queue body could not be decoded into an envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    // ========================================================================
    // Delivery Errors (400-499)
    // ========================================================================

    /// Fetching the blob behind an envelope failed
    #[error("Blob fetch failed: {0}")]
    BlobFetchFailed(String),

    /// The logging backend answered with a non-success status
    #[error("Logging backend rejected delivery with status {status}")]
    BackendRejected {
        /// HTTP status returned by the backend
        status: u16,
    },

    /// Network-level failure talking to a remote service
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded wait elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Protocol Errors (500-599)
    // ========================================================================

    /// The messaging session is not connected
    #[error("Not connected to the messaging network")]
    NotConnected,

    /// A call into the protocol collaborator failed
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A conversation identifier could not be parsed
    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    // ========================================================================
    // Validation Errors (600-699)
    // ========================================================================

    /// Command surface input was rejected
    #[error("Validation failed: {0}")]
    Validation(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric code for this error, grouped by domain
    pub fn code(&self) -> i32 {
        match self {
            Error::Config(_) => 100,

            Error::DatabaseError(_) => 200,
            Error::BlobStoreError(_) => 201,

            Error::QueueUnavailable(_) => 300,
            Error::MalformedEnvelope(_) => 301,

            Error::BlobFetchFailed(_) => 400,
            Error::BackendRejected { .. } => 401,
            Error::Transport(_) => 402,
            Error::Timeout(_) => 403,

            Error::NotConnected => 500,
            Error::ProtocolError(_) => 501,
            Error::InvalidJid(_) => 502,

            Error::Validation(_) => 600,

            Error::SerializationError(_) => 900,
            Error::Internal(_) => 901,
        }
    }

    /// Check if this error is transient
    ///
    /// A recoverable delivery error leaves the envelope in the queue so the
    /// visibility timeout hands it out again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BlobFetchFailed(_)
                | Error::BackendRejected { .. }
                | Error::Transport(_)
                | Error::Timeout(_)
                | Error::QueueUnavailable(_)
                | Error::NotConnected
        )
    }

    /// Check if this error must stop the process before the relay starts
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::BlobStoreError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
