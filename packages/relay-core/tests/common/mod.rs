//! Shared harness: a local logging backend that also hosts the blob bucket,
//! and a fully wired relay around it.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use relay_core::protocol::InMemoryProtocol;
use relay_core::{
    BlobConfig, Database, EventPipeline, FileBlobStore, Forwarder, ForwarderConfig, Jid,
    PollerConfig, Producer, QueueConfig, QueueConsumer, SqliteQueue,
};

/// One multipart POST as the backend saw it.
#[derive(Debug, Clone, Default)]
pub struct LoggedPost {
    pub authorization: String,
    pub fields: HashMap<String, String>,
    pub file_name: Option<String>,
    pub file: Vec<u8>,
}

#[derive(Clone)]
struct BackendState {
    statuses: Arc<Mutex<VecDeque<u16>>>,
    default_status: u16,
    posts: Arc<Mutex<Vec<LoggedPost>>>,
    blobs: Arc<Mutex<Option<FileBlobStore>>>,
}

pub struct Backend {
    pub base_url: String,
    state: BackendState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Backend {
    /// Answer with `statuses` in order, then `default_status` forever.
    pub async fn start(statuses: &[u16], default_status: u16) -> Self {
        let state = BackendState {
            statuses: Arc::new(Mutex::new(statuses.iter().copied().collect())),
            default_status,
            posts: Arc::new(Mutex::new(Vec::new())),
            blobs: Arc::new(Mutex::new(None)),
        };
        let app = Router::new()
            .route("/log-message", post(log_message))
            .route("/blobs/:bucket/:filename", get(serve_blob))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind backend");
        let addr = listener.local_addr().expect("backend addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        tokio::spawn(async move {
            let _ = server.await;
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/log-message", self.base_url)
    }

    pub fn host_blobs(&self, store: FileBlobStore) {
        *self.state.blobs.lock() = Some(store);
    }

    pub fn posts(&self) -> Vec<LoggedPost> {
        self.state.posts.lock().clone()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn log_message(
    State(state): State<BackendState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> StatusCode {
    let mut logged = LoggedPost {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ..LoggedPost::default()
    };

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "files" {
            logged.file_name = field.file_name().map(str::to_string);
            logged.file = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        } else {
            let value = field.text().await.unwrap_or_default();
            logged.fields.insert(name, value);
        }
    }

    state.posts.lock().push(logged);
    let status = state
        .statuses
        .lock()
        .pop_front()
        .unwrap_or(state.default_status);
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn serve_blob(
    State(state): State<BackendState>,
    Path((bucket, filename)): Path<(String, String)>,
) -> impl IntoResponse {
    let found = state
        .blobs
        .lock()
        .as_ref()
        .and_then(|store| store.get(&bucket, &filename));
    match found {
        Some((data, content_type)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], data).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A relay wired against a [`Backend`], driven cycle by cycle.
pub struct Relay {
    pub pipeline: EventPipeline,
    pub queue: Arc<SqliteQueue>,
    pub consumer: QueueConsumer,
    pub protocol: Arc<InMemoryProtocol>,
    pub database: Database,
    _dir: tempfile::TempDir,
}

impl Relay {
    pub fn new(backend: &Backend, own: Jid, visibility: Duration, max_receives: u32) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs = FileBlobStore::new(&BlobConfig {
            root: dir.path().to_path_buf(),
            bucket: "media".into(),
            public_url: backend.base_url.clone(),
        });
        backend.host_blobs(blobs.clone());

        let queue = Arc::new(
            SqliteQueue::open(&QueueConfig {
                path: Some(dir.path().join("queue.db")),
                visibility_timeout: visibility,
                max_receives,
                ..QueueConfig::default()
            })
            .expect("open queue"),
        );
        let database = Database::open(Some(&dir.path().join("messages.db"))).expect("open db");
        let protocol = Arc::new(InMemoryProtocol::new(own));

        let pipeline = EventPipeline::new(
            database.clone(),
            Producer::new(queue.clone(), Arc::new(blobs)),
            protocol.clone(),
        );
        let forwarder = Forwarder::new(ForwarderConfig::new(backend.endpoint(), "test-token"))
            .expect("forwarder");
        let consumer = QueueConsumer::new(
            queue.clone(),
            Arc::new(forwarder),
            PollerConfig {
                batch_size: 10,
                wait: Duration::ZERO,
                interval: Duration::from_millis(10),
            },
        );

        Self {
            pipeline,
            queue,
            consumer,
            protocol,
            database,
            _dir: dir,
        }
    }
}
