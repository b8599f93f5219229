//! Queue envelope: the unit of work crossing the relay boundary.
//!
//! ## Wire Format
//!
//! ```text
//! {
//!   "kind":    "text" | "image" | "document",
//!   "from":    "<sender>",
//!   "to":      "<recipient>",
//!   "body":    "<text or caption>",
//!   "blobURL": "<fetchable URL, empty for text>",
//!   "time":    <epoch millis>,
//!   "message_id":  "<protocol message id>",      (optional)
//!   "admin_phone": "<local account user>",       (optional)
//!   "parent_message_id": "<quoted message id>"   (optional)
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Text,
    Image,
    Document,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Text => "text",
            EnvelopeKind::Image => "image",
            EnvelopeKind::Document => "document",
        }
    }

    /// Whether delivery needs a blob fetch first.
    pub fn has_blob(&self) -> bool {
        !matches!(self, EnvelopeKind::Text)
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chat event destined for the logging backend.
///
/// Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "blobURL", default)]
    pub blob_url: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_phone: String,
    /// Never populated by the classifier; carried so the backend field has a
    /// source once a mapping is defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

impl QueueEnvelope {
    /// A text envelope.
    pub fn text(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Text,
            from: from.into(),
            to: to.into(),
            body: body.into(),
            blob_url: String::new(),
            time: crate::time::truncate_to_millis(time),
            message_id: String::new(),
            admin_phone: String::new(),
            parent_message_id: None,
        }
    }

    /// An image or document envelope pointing at an uploaded blob.
    pub fn media(
        kind: EnvelopeKind,
        from: impl Into<String>,
        to: impl Into<String>,
        caption: impl Into<String>,
        blob_url: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            blob_url: blob_url.into(),
            ..Self::text(from, to, caption, time)
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn with_admin_phone(mut self, phone: impl Into<String>) -> Self {
        self.admin_phone = phone.into();
        self
    }

    /// Serialize for the queue.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue body. Any failure is `MalformedEnvelope`.
    pub fn decode(body: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(body).map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        if envelope.kind.has_blob() && envelope.blob_url.is_empty() {
            return Err(Error::MalformedEnvelope(format!(
                "{} envelope without blobURL",
                envelope.kind
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::from_millis;

    #[test]
    fn test_round_trip_is_identical() {
        let envelope = QueueEnvelope::media(
            EnvelopeKind::Document,
            "15551234567",
            "120363041234@g.us",
            "Q3 report",
            "http://127.0.0.1:6000/blobs/media/ab12.pdf",
            from_millis(1_714_557_600_123),
        )
        .with_message_id("3EB0C431")
        .with_admin_phone("15559990000");

        let encoded = envelope.encode().unwrap();
        let decoded = QueueEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = QueueEnvelope::text("+1555", "+1777", "hi", from_millis(1_000));
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["kind"], "text");
        assert_eq!(value["from"], "+1555");
        assert_eq!(value["to"], "+1777");
        assert_eq!(value["body"], "hi");
        assert_eq!(value["blobURL"], "");
        assert_eq!(value["time"], 1_000);
        assert!(value.get("message_id").is_none());
        assert!(value.get("parent_message_id").is_none());
    }

    #[test]
    fn test_text_constructor_truncates_time() {
        use chrono::TimeZone;
        let precise = Utc.timestamp_opt(1_700_000_000, 987_654_321).unwrap();
        let envelope = QueueEnvelope::text("a", "b", "c", precise);
        assert_eq!(envelope.time.timestamp_subsec_nanos(), 987_000_000);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = QueueEnvelope::decode("not json").unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));

        let err = QueueEnvelope::decode(r#"{"kind":"video","from":"a","to":"b","time":1}"#)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_rejects_media_without_url() {
        let body = r#"{"kind":"image","from":"a","to":"b","body":"","blobURL":"","time":1}"#;
        let err = QueueEnvelope::decode(body).unwrap_err();
        assert!(err.to_string().contains("blobURL"));
    }
}
