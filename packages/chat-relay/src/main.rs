//! Chat Relay Server
//!
//! Sits next to a paired messaging session and:
//!
//! 1. **Keeps local history**: every text message (live or backfilled by a
//!    history sync) lands in a SQLite chat/message store with a resolved
//!    display name per chat.
//!
//! 2. **Relays for audit**: every message becomes one or more queue
//!    envelopes; media is uploaded to the blob store first. A background
//!    consumer delivers envelopes to the logging backend and deletes them
//!    only once the backend accepted them.
//!
//! 3. **Sends on command**: text, image and document sends go out through
//!    the session and are relayed like any other outbound message.

mod api;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use relay_core::protocol::{GatewayClient, InMemoryProtocol};
use relay_core::{
    BlobConfig, ChatProtocol, Database, Error, EventPipeline, FileBlobStore, Forwarder,
    ForwarderConfig, GatewayConfig, Jid, PollerConfig, Producer, QueueConfig, QueueConsumer,
    RelayConfig, SqliteQueue,
};

use state::AppState;

/// Request body cap for uploads and event intake (64 MiB).
const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "chat-relay", version, about = "Chat audit relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6000, env = "RELAY_PORT")]
    port: u16,

    /// Bearer credential for the logging backend
    #[arg(long, default_value = "", env = "BEARER_TOKEN", hide_env_values = true)]
    bearer_token: String,

    /// Full URL of the logging backend's log-message endpoint
    #[arg(long, default_value = "", env = "LOG_API_ENDPOINT")]
    log_api_endpoint: String,

    /// Directory holding the history database, the queue and the blobs
    #[arg(long, default_value = "store", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Logical queue name
    #[arg(long, default_value = "chat-events", env = "QUEUE_NAME")]
    queue_name: String,

    /// Seconds a received envelope stays hidden before redelivery
    #[arg(long, default_value_t = 30, env = "QUEUE_VISIBILITY_TIMEOUT_SECS")]
    queue_visibility_timeout_secs: u64,

    /// Receives allowed before an envelope is dead-lettered
    #[arg(long, default_value_t = 5, env = "QUEUE_MAX_RECEIVES")]
    queue_max_receives: u32,

    /// Envelopes fetched per poll cycle (1-10)
    #[arg(long, default_value_t = 10, env = "POLL_BATCH_SIZE")]
    poll_batch_size: usize,

    /// Long-poll wait per receive, in seconds
    #[arg(long, default_value_t = 5, env = "POLL_WAIT_SECS")]
    poll_wait_secs: u64,

    /// Sleep between poll cycles, in seconds
    #[arg(long, default_value_t = 10, env = "POLL_INTERVAL_SECS")]
    poll_interval_secs: u64,

    /// Blob bucket name
    #[arg(long, default_value = "media", env = "BLOB_BUCKET")]
    blob_bucket: String,

    /// Externally reachable base URL serving `/blobs/...`.
    /// Defaults to this server on localhost.
    #[arg(long, env = "BLOB_PUBLIC_URL")]
    blob_public_url: Option<String>,

    /// Protocol gateway base URL
    #[arg(long, default_value = "http://127.0.0.1:6001", env = "GATEWAY_URL")]
    gateway_url: String,

    /// Run without a gateway, as this account, using an in-memory session.
    /// Sends are recorded but go nowhere.
    #[arg(long, env = "OFFLINE_JID")]
    offline_jid: Option<String>,

    /// Timeout for the POST to the logging backend, in seconds
    #[arg(long, default_value_t = 15, env = "POST_TIMEOUT_SECS")]
    post_timeout_secs: u64,

    /// Timeout for fetching a blob before delivery, in seconds
    #[arg(long, default_value_t = 30, env = "FETCH_TIMEOUT_SECS")]
    fetch_timeout_secs: u64,

    /// Largest accepted body for media sends and event intake, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, env = "MAX_UPLOAD_BYTES")]
    max_upload_bytes: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        let mut forwarder = ForwarderConfig::new(&self.log_api_endpoint, &self.bearer_token);
        forwarder.post_timeout = Duration::from_secs(self.post_timeout_secs);
        forwarder.fetch_timeout = Duration::from_secs(self.fetch_timeout_secs);

        RelayConfig {
            forwarder,
            poller: PollerConfig {
                batch_size: self.poll_batch_size,
                wait: Duration::from_secs(self.poll_wait_secs),
                interval: Duration::from_secs(self.poll_interval_secs),
            },
            queue: QueueConfig {
                name: self.queue_name.clone(),
                path: Some(self.data_dir.join("queue.db")),
                visibility_timeout: Duration::from_secs(self.queue_visibility_timeout_secs),
                max_receives: self.queue_max_receives,
            },
            blob: BlobConfig {
                root: self.data_dir.clone(),
                bucket: self.blob_bucket.clone(),
                public_url: self
                    .blob_public_url
                    .clone()
                    .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port)),
            },
            gateway: GatewayConfig {
                base_url: self.gateway_url.clone(),
                ..GatewayConfig::default()
            },
            history_path: Some(self.data_dir.join("messages.db")),
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, code = e.code(), "Relay stopped");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chat_relay=info,relay_core=info,tower_http=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(args: Args) -> relay_core::Result<()> {
    let config = args.relay_config();
    config.validate()?;

    std::fs::create_dir_all(&args.data_dir).map_err(|e| {
        Error::Config(format!("cannot create {}: {}", args.data_dir.display(), e))
    })?;

    let database = Database::open(config.history_path.as_deref())?;
    let queue = Arc::new(SqliteQueue::open(&config.queue)?);
    let blobs = FileBlobStore::new(&config.blob);
    let restored = blobs.load_from_disk();

    let protocol: Arc<dyn ChatProtocol> = match args.offline_jid.as_deref() {
        Some(own) => {
            tracing::warn!(own_jid = own, "Running with an in-memory session");
            Arc::new(InMemoryProtocol::new(Jid::from_recipient(own)?))
        }
        None => Arc::new(GatewayClient::new(&config.gateway)?),
    };

    let pipeline = EventPipeline::new(
        database,
        Producer::new(queue.clone(), Arc::new(blobs.clone())),
        protocol,
    );

    // ── Relay Consumer ────────────────────────────────────────────────────

    let forwarder = Forwarder::new(config.forwarder.clone())?;
    let consumer = QueueConsumer::new(queue.clone(), Arc::new(forwarder), config.poller.clone());
    let consumer_stats = consumer.stats();
    let cancel = CancellationToken::new();
    let consumer_handle = consumer.spawn(cancel.clone());

    tracing::info!(
        queue = %config.queue.name,
        endpoint = %config.forwarder.endpoint,
        blobs = restored,
        data_dir = %args.data_dir.display(),
        "Relay consumer started"
    );

    // ── HTTP Server ───────────────────────────────────────────────────────

    let state = AppState::new(pipeline, queue, blobs, consumer_stats);
    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Chat relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app(state, args.max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

    tracing::info!("Shutting down relay consumer");
    cancel.cancel();
    if let Err(e) = consumer_handle.await {
        tracing::warn!(error = %e, "Relay consumer task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn app(state: AppState, max_upload_bytes: usize) -> Router {
    let body_limit = DefaultBodyLimit::max(max_upload_bytes);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route(
            "/api/events",
            post(api::ingest_event).layer(body_limit.clone()),
        )
        .route("/api/send", post(api::send_message))
        .route(
            "/api/send-image",
            post(api::send_image).layer(body_limit.clone()),
        )
        .route(
            "/api/send-document",
            post(api::send_document).layer(body_limit),
        )
        .route("/api/chats", get(api::list_chats))
        .route("/api/chats/:jid/messages", get(api::list_messages))
        .route("/api/dead-letters", get(api::list_dead_letters))
        .route("/blobs/:bucket/:filename", get(api::get_blob))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": state.pipeline.protocol().is_connected().await,
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats().await)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
