//! Delivery forwarder.
//!
//! One envelope in, one authenticated multipart POST out:
//!
//! | field                      | value                              |
//! |----------------------------|------------------------------------|
//! | `entity_phone_number_from` | envelope sender                    |
//! | `entity_phone_number_to`   | envelope recipient                 |
//! | `message_text`             | body or caption                    |
//! | `message_status`           | `READ`                             |
//! | `message_time`             | epoch millis                       |
//! | `admin_phone`              | local account                      |
//! | `wa_message_id`            | protocol message id                |
//! | `wa_parent_message_id`     | parent id, empty when unknown      |
//! | `files`                    | blob bytes, named by URL basename  |
//!
//! Media kinds fetch the blob first. Only HTTP 200 from the backend counts
//! as delivered. The forwarder never touches the queue.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};

use crate::config::ForwarderConfig;
use crate::envelope::QueueEnvelope;
use crate::error::{Error, Result};
use crate::queue::Delivery;

/// Constant delivery status reported to the backend.
pub const MESSAGE_STATUS: &str = "READ";

/// Multipart field carrying the media file.
pub const FILE_FIELD: &str = "files";

/// Forwards envelopes to the logging backend.
#[derive(Clone)]
pub struct Forwarder {
    http: Client,
    config: ForwarderConfig,
}

impl Forwarder {
    /// Build a forwarder. A missing credential or endpoint is a
    /// configuration error, never a per-message failure.
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Deliver one envelope.
    pub async fn forward(&self, envelope: &QueueEnvelope) -> Result<()> {
        let mut form = text_fields(envelope)
            .into_iter()
            .fold(Form::new(), |form, (name, value)| form.text(name, value));

        if envelope.kind.has_blob() {
            form = form.part(FILE_FIELD, self.fetch_blob(&envelope.blob_url).await?);
        }

        let resp = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.bearer_token)
            .timeout(self.config.post_timeout)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                kind = %envelope.kind,
                message_id = %envelope.message_id,
                status = status.as_u16(),
                body = %body,
                "Logging backend rejected envelope"
            );
            return Err(Error::BackendRejected {
                status: status.as_u16(),
            });
        }

        tracing::info!(
            kind = %envelope.kind,
            message_id = %envelope.message_id,
            from = %envelope.from,
            to = %envelope.to,
            "Envelope logged"
        );
        Ok(())
    }

    async fn fetch_blob(&self, url: &str) -> Result<Part> {
        let resp = self
            .http
            .get(url)
            .timeout(self.config.fetch_timeout)
            .send()
            .await
            .map_err(|e| Error::BlobFetchFailed(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::BlobFetchFailed(format!("{} returned {}", url, status)));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::BlobFetchFailed(format!("{}: {}", url, e)))?;

        tracing::debug!(url, size = bytes.len(), "Blob fetched");

        let part = Part::bytes(bytes.to_vec()).file_name(basename(url));
        part.mime_str(&content_type)
            .map_err(|e| Error::BlobFetchFailed(format!("{}: bad content type: {}", url, e)))
    }
}

#[async_trait]
impl Delivery for Forwarder {
    async fn deliver(&self, envelope: &QueueEnvelope) -> Result<()> {
        self.forward(envelope).await
    }
}

/// The non-file multipart fields for an envelope.
pub fn text_fields(envelope: &QueueEnvelope) -> Vec<(&'static str, String)> {
    vec![
        ("entity_phone_number_from", envelope.from.clone()),
        ("entity_phone_number_to", envelope.to.clone()),
        ("message_text", envelope.body.clone()),
        ("message_status", MESSAGE_STATUS.to_string()),
        ("message_time", envelope.time.timestamp_millis().to_string()),
        ("admin_phone", envelope.admin_phone.clone()),
        ("wa_message_id", envelope.message_id.clone()),
        (
            "wa_parent_message_id",
            envelope.parent_message_id.clone().unwrap_or_default(),
        ),
    ]
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn basename(url: &str) -> String {
    let from_url = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    });
    from_url
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            url.rsplit('/')
                .next()
                .unwrap_or_default()
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        })
}
