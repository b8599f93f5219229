//! HTTP handlers.
//!
//! - `POST /api/events`  protocol events pushed by the gateway
//! - `POST /api/send`  send a text message (JSON)
//! - `POST /api/send-image`  send an image (multipart)
//! - `POST /api/send-document`  send a document (multipart)
//! - `GET  /api/chats`  local chat list
//! - `GET  /api/chats/:jid/messages`  stored messages, newest first
//! - `GET  /api/dead-letters`  entries that exhausted their receives
//! - `GET  /blobs/:bucket/:filename`  stored media

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use relay_core::pipeline::OutboundMedia;
use relay_core::protocol::SendReceipt;
use relay_core::{EnvelopeKind, Error, Jid, ProtocolEvent};

use crate::state::AppState;

/// Default page size for list endpoints.
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

// ── Response Types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response<T: Serialize>(
    status: StatusCode,
    msg: &str,
) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        status,
        Json(ApiResponse {
            ok: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Reply shape of the send endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
    /// Outcome of queueing the sent message for the logging backend.
    #[serde(default)]
    pub message_logged: String,
}

fn send_reply(status: StatusCode, success: bool, message: String, logged: String) -> Response {
    (
        status,
        Json(SendResponse {
            success,
            message,
            message_logged: logged,
        }),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    send_reply(StatusCode::BAD_REQUEST, false, message.to_string(), String::new())
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// ── Event Intake ─────────────────────────────────────────────────────────────

/// POST /api/events
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<ProtocolEvent>,
) -> impl IntoResponse {
    match state.pipeline.handle_event(event).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("accepted")).into_response(),
        Err(e) => {
            tracing::error!(error = %e, code = e.code(), "Event handling failed");
            let status = match e {
                Error::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response::<()>(status, &e.to_string()).into_response()
        }
    }
}

// ── Send Commands ────────────────────────────────────────────────────────────

/// POST /api/send
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Response {
    if req.recipient.trim().is_empty() || req.message.is_empty() {
        return bad_request("Recipient and message are required");
    }
    let to = match Jid::from_recipient(&req.recipient) {
        Ok(jid) => jid,
        Err(e) => return bad_request(&e.to_string()),
    };

    let receipt = match state.pipeline.protocol().send_text(&to, &req.message).await {
        Ok(receipt) => receipt,
        Err(e) => return send_failed(&to, e),
    };
    let logged = log_outbound(&state, &to, &req.message, &receipt, None).await;
    sent(&req.recipient, logged)
}

/// POST /api/send-image
///
/// Multipart fields: `file`, `recipient` and `message` (the caption), all
/// required.
pub async fn send_image(State(state): State<AppState>, multipart: Multipart) -> Response {
    send_media(state, EnvelopeKind::Image, multipart).await
}

/// POST /api/send-document
pub async fn send_document(State(state): State<AppState>, multipart: Multipart) -> Response {
    send_media(state, EnvelopeKind::Document, multipart).await
}

struct MediaForm {
    recipient: String,
    caption: String,
    file: Option<UploadedFile>,
}

struct UploadedFile {
    name: String,
    mimetype: String,
    bytes: Vec<u8>,
}

/// Collect the send form. A read failure (oversized or truncated body) is
/// returned as is so the caller can report its status.
async fn read_media_form(
    mut multipart: Multipart,
    kind: EnvelopeKind,
) -> Result<MediaForm, MultipartError> {
    let mut form = MediaForm {
        recipient: String::new(),
        caption: String::new(),
        file: None,
    };

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .filter(|n| !n.is_empty())
                    .unwrap_or(kind.as_str())
                    .to_string();
                let mimetype = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| default_mimetype(kind).to_string());
                let bytes = field.bytes().await?;
                form.file = Some(UploadedFile {
                    name: file_name,
                    mimetype,
                    bytes: bytes.to_vec(),
                });
            }
            "recipient" => form.recipient = field.text().await?,
            "message" => form.caption = field.text().await?,
            _ => {}
        }
    }
    Ok(form)
}

fn default_mimetype(kind: EnvelopeKind) -> &'static str {
    match kind {
        EnvelopeKind::Image => "image/jpeg",
        _ => "application/octet-stream",
    }
}

async fn send_media(state: AppState, kind: EnvelopeKind, multipart: Multipart) -> Response {
    let form = match read_media_form(multipart, kind).await {
        Ok(form) => form,
        Err(e) => {
            tracing::warn!(kind = %kind, status = e.status().as_u16(), error = %e, "Failed to read upload");
            return send_reply(e.status(), false, e.body_text(), String::new());
        }
    };
    let Some(file) = form.file.filter(|f| !f.bytes.is_empty()) else {
        return bad_request("Error retrieving file");
    };
    if form.recipient.trim().is_empty() || form.caption.is_empty() {
        return bad_request("Recipient and message are required");
    }
    let to = match Jid::from_recipient(&form.recipient) {
        Ok(jid) => jid,
        Err(e) => return bad_request(&e.to_string()),
    };

    let protocol = state.pipeline.protocol();
    let result = match kind {
        EnvelopeKind::Image => {
            protocol
                .send_image(&to, &form.caption, file.bytes.clone(), &file.mimetype)
                .await
        }
        _ => {
            protocol
                .send_document(&to, &form.caption, file.bytes.clone(), &file.name, &file.mimetype)
                .await
        }
    };
    let receipt = match result {
        Ok(receipt) => receipt,
        Err(e) => return send_failed(&to, e),
    };

    let media = OutboundMedia {
        kind,
        file_name: &file.name,
        bytes: &file.bytes,
        mimetype: &file.mimetype,
    };
    let logged = log_outbound(&state, &to, &form.caption, &receipt, Some(media)).await;
    sent(&form.recipient, logged)
}

/// Queue a sent message for the logging backend. The send already happened,
/// so a failure here only changes the `message_logged` text.
async fn log_outbound(
    state: &AppState,
    to: &Jid,
    text: &str,
    receipt: &SendReceipt,
    media: Option<OutboundMedia<'_>>,
) -> String {
    match state.pipeline.record_outbound(to, text, receipt, media).await {
        Ok(_) => "Message queued for logging".to_string(),
        Err(e) => {
            tracing::warn!(to = %to, message_id = %receipt.id, error = %e, "Failed to queue sent message");
            format!("Failed to queue message for logging: {}", e)
        }
    }
}

fn sent(recipient: &str, logged: String) -> Response {
    send_reply(
        StatusCode::OK,
        true,
        format!("Message sent to {}", recipient.trim()),
        logged,
    )
}

fn send_failed(to: &Jid, e: Error) -> Response {
    tracing::error!(to = %to, error = %e, "Send failed");
    send_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        false,
        format!("Error sending message: {}", e),
        String::new(),
    )
}

// ── History ──────────────────────────────────────────────────────────────────

/// GET /api/chats
pub async fn list_chats(State(state): State<AppState>) -> Response {
    match state.pipeline.database().get_chats() {
        Ok(chats) => ApiResponse::ok(chats).into_response(),
        Err(e) => error_response::<()>(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .into_response(),
    }
}

/// GET /api/chats/:jid/messages?limit=N
pub async fn list_messages(
    State(state): State<AppState>,
    Path(jid): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.pipeline.database().get_messages(&jid, query.limit()) {
        Ok(messages) => ApiResponse::ok(messages).into_response(),
        Err(e) => error_response::<()>(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .into_response(),
    }
}

/// GET /api/dead-letters?limit=N
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.queue.dead_letters(query.limit()) {
        Ok(dead) => ApiResponse::ok(dead).into_response(),
        Err(e) => error_response::<()>(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            .into_response(),
    }
}

// ── Blobs ────────────────────────────────────────────────────────────────────

/// GET /blobs/:bucket/:filename
///
/// Blobs are content-addressed, so they never change once written.
pub async fn get_blob(
    State(state): State<AppState>,
    Path((bucket, filename)): Path<(String, String)>,
) -> Response {
    match state.blobs.get(&bucket, &filename) {
        Some((data, content_type)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=31536000, immutable".to_string(),
                ),
            ],
            data,
        )
            .into_response(),
        None => error_response::<()>(StatusCode::NOT_FOUND, "Blob not found").into_response(),
    }
}
