//! HTTP client for the protocol gateway sidecar.
//!
//! The gateway holds the paired messaging session. It pushes events to the
//! relay and exposes the calls below:
//!
//! - `GET  /session`  own JID and connection state
//! - `GET  /groups/:jid`  live group info
//! - `GET  /contacts/:jid`  address-book entry (404 when unknown)
//! - `POST /media/download`  raw bytes for a media descriptor
//! - `POST /messages/text`  send text
//! - `POST /messages/image`  send image (multipart)
//! - `POST /messages/document`  send document (multipart)

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{ChatProtocol, Jid, MediaAttachment, SendReceipt};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct SessionResponse {
    jid: Option<Jid>,
    #[serde(default)]
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct GroupInfoResponse {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContactResponse {
    #[serde(default)]
    full_name: String,
}

#[derive(Debug, Serialize)]
struct SendTextRequest<'a> {
    to: String,
    text: &'a str,
}

/// `ChatProtocol` over the gateway's HTTP API.
pub struct GatewayClient {
    http: Client,
    base_url: String,
    /// The account never changes while the session is paired.
    own_jid: RwLock<Option<Jid>>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build gateway client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            own_jid: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn session(&self) -> Result<SessionResponse> {
        let resp = self.http.get(self.url("/session")).send().await?;
        let resp = ensure_success(resp, "session").await?;
        Ok(resp.json().await?)
    }

    async fn send_media(&self, path: &str, form: Form) -> Result<SendReceipt> {
        let resp = self.http.post(self.url(path)).multipart(form).send().await?;
        let resp = ensure_success(resp, path).await?;
        Ok(resp.json().await?)
    }
}

async fn ensure_success(resp: Response, call: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    tracing::warn!(call, status = %status, body = %body, "Gateway call failed");
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(Error::NotConnected);
    }
    Err(Error::ProtocolError(format!("{} returned {}", call, status)))
}

fn file_part(bytes: Vec<u8>, file_name: &str, mimetype: &str) -> Result<Part> {
    Part::bytes(bytes)
        .file_name(file_name.to_string())
        .mime_str(mimetype)
        .map_err(|e| Error::Validation(format!("Invalid mime type {}: {}", mimetype, e)))
}

#[async_trait]
impl ChatProtocol for GatewayClient {
    async fn own_jid(&self) -> Result<Jid> {
        let cached = self.own_jid.read().clone();
        if let Some(jid) = cached {
            return Ok(jid);
        }
        let jid = self.session().await?.jid.ok_or(Error::NotConnected)?;
        *self.own_jid.write() = Some(jid.clone());
        Ok(jid)
    }

    async fn is_connected(&self) -> bool {
        match self.session().await {
            Ok(session) => session.connected,
            Err(e) => {
                tracing::debug!(error = %e, "Gateway session check failed");
                false
            }
        }
    }

    async fn group_name(&self, group: &Jid) -> Result<Option<String>> {
        let path = format!("/groups/{}", urlencoding::encode(&group.to_string()));
        let resp = self.http.get(self.url(&path)).send().await?;
        let info: GroupInfoResponse = ensure_success(resp, "groups").await?.json().await?;
        Ok(Some(info.name).filter(|n| !n.is_empty()))
    }

    async fn contact_full_name(&self, jid: &Jid) -> Result<Option<String>> {
        let path = format!("/contacts/{}", urlencoding::encode(&jid.to_string()));
        let resp = self.http.get(self.url(&path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let contact: ContactResponse = ensure_success(resp, "contacts").await?.json().await?;
        Ok(Some(contact.full_name).filter(|n| !n.is_empty()))
    }

    async fn download(&self, media: &MediaAttachment) -> Result<Vec<u8>> {
        let resp = self
            .http
            .post(self.url("/media/download"))
            .json(media)
            .send()
            .await?;
        let resp = ensure_success(resp, "media/download").await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<SendReceipt> {
        let body = SendTextRequest {
            to: to.to_string(),
            text,
        };
        let resp = self
            .http
            .post(self.url("/messages/text"))
            .json(&body)
            .send()
            .await?;
        let resp = ensure_success(resp, "messages/text").await?;
        Ok(resp.json().await?)
    }

    async fn send_image(
        &self,
        to: &Jid,
        caption: &str,
        image: Vec<u8>,
        mimetype: &str,
    ) -> Result<SendReceipt> {
        let form = Form::new()
            .text("to", to.to_string())
            .text("caption", caption.to_string())
            .text("mimetype", mimetype.to_string())
            .part("file", file_part(image, "image", mimetype)?);
        self.send_media("/messages/image", form).await
    }

    async fn send_document(
        &self,
        to: &Jid,
        caption: &str,
        document: Vec<u8>,
        file_name: &str,
        mimetype: &str,
    ) -> Result<SendReceipt> {
        let form = Form::new()
            .text("to", to.to_string())
            .text("caption", caption.to_string())
            .text("file_name", file_name.to_string())
            .text("mimetype", mimetype.to_string())
            .part("file", file_part(document, file_name, mimetype)?);
        self.send_media("/messages/document", form).await
    }
}
