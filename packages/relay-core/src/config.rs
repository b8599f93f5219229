//! Relay configuration.
//!
//! One `RelayConfig` is built at startup and each component takes the section
//! it needs. There is no process-wide configuration object.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Envelopes fetched per poll cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Long-poll wait per receive call.
pub const DEFAULT_POLL_WAIT_SECS: u64 = 5;

/// Sleep between poll cycles.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Timeout for the POST to the logging backend.
pub const DEFAULT_POST_TIMEOUT_SECS: u64 = 15;

/// Timeout for fetching a blob before the POST.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// How long a received entry stays hidden before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;

/// Receives allowed before an entry is dead-lettered.
pub const DEFAULT_MAX_RECEIVES: u32 = 5;

/// Largest batch a single receive may claim.
pub const MAX_BATCH_SIZE: usize = 10;

/// Logging backend delivery settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Full URL of the log-message endpoint.
    pub endpoint: String,
    /// Bearer credential sent with every POST.
    pub bearer_token: String,
    pub post_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl ForwarderConfig {
    /// Settings with the default timeouts.
    pub fn new(endpoint: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: bearer_token.into(),
            post_timeout: Duration::from_secs(DEFAULT_POST_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }

    /// Reject a configuration the relay cannot deliver with.
    pub fn validate(&self) -> Result<()> {
        if self.bearer_token.trim().is_empty() {
            return Err(Error::Config("BEARER_TOKEN is not set".into()));
        }
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Config("LOG_API_ENDPOINT is not set".into()));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "LOG_API_ENDPOINT must be an http(s) URL, got {}",
                endpoint
            )));
        }
        Ok(())
    }
}

/// Consumer loop cadence.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: usize,
    pub wait: Duration,
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            wait: Duration::from_secs(DEFAULT_POLL_WAIT_SECS),
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

/// Durable queue identity and redelivery policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue name; several queues may share one database file.
    pub name: String,
    /// Database file. `None` keeps the queue in memory (tests only).
    pub path: Option<PathBuf>,
    pub visibility_timeout: Duration,
    /// An entry received more often than this is moved to the dead-letter table.
    pub max_receives: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "chat-events".to_string(),
            path: None,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            max_receives: DEFAULT_MAX_RECEIVES,
        }
    }
}

/// Blob object store location.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Root directory; blobs land in `{root}/blobs/{bucket}/`.
    pub root: PathBuf,
    pub bucket: String,
    /// Externally reachable base URL that serves `/blobs/{bucket}/{file}`.
    pub public_url: String,
}

/// Protocol gateway sidecar location.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:6001".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub forwarder: ForwarderConfig,
    pub poller: PollerConfig,
    pub queue: QueueConfig,
    pub blob: BlobConfig,
    pub gateway: GatewayConfig,
    /// Local history database file. `None` keeps history in memory.
    pub history_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Check everything the relay loop depends on.
    ///
    /// Any error here is fatal: the process must not start the consumer.
    pub fn validate(&self) -> Result<()> {
        self.forwarder.validate()?;

        if self.poller.batch_size == 0 || self.poller.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "poll batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.poller.batch_size
            )));
        }
        if self.queue.max_receives == 0 {
            return Err(Error::Config("queue max receives must be at least 1".into()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(Error::Config("queue name must not be empty".into()));
        }
        if self.blob.bucket.trim().is_empty() || self.blob.bucket.contains('/') {
            return Err(Error::Config(format!(
                "invalid blob bucket name: {:?}",
                self.blob.bucket
            )));
        }
        Ok(())
    }
}
