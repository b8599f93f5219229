//! # Protocol Boundary
//!
//! Types and the trait the relay uses to talk to the messaging-protocol
//! client. The protocol client itself (pairing, encryption, wire format) is
//! an external collaborator; the relay only sees typed events coming in and
//! makes send/download/lookup calls going out.
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────────┐   ProtocolEvent (JSON)   ┌──────────────────┐
//! │   Gateway    │ ───────────────────────► │  EventPipeline   │
//! │  (sidecar)   │                          │                  │
//! │              │ ◄─────────────────────── │  ChatProtocol    │
//! └──────────────┘  download / send / info  └──────────────────┘
//! ```

pub mod gateway;
pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use gateway::GatewayClient;
pub use memory::InMemoryProtocol;

/// Server for one-to-one user chats.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Server marking group conversations.
pub const GROUP_SERVER: &str = "g.us";

/// User part of the synthetic status-broadcast identity.
pub const STATUS_USER: &str = "status";

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaque conversation / participant identifier (`user@server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// A phone number on the user server.
    pub fn phone(number: impl Into<String>) -> Self {
        Self::new(number, USER_SERVER)
    }

    /// Parse a command-surface recipient: a full JID when it contains `@`,
    /// otherwise a bare phone number.
    pub fn from_recipient(recipient: &str) -> Result<Self> {
        let recipient = recipient.trim();
        if recipient.contains('@') {
            recipient.parse()
        } else if recipient.is_empty() {
            Err(Error::InvalidJid("empty recipient".into()))
        } else {
            Ok(Self::phone(recipient))
        }
    }

    /// Whether this identifier carries the group marker.
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Whether this is the status-broadcast pseudo-chat.
    pub fn is_status(&self) -> bool {
        self.user == STATUS_USER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server.is_empty() {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (user, server) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::InvalidJid(s.to_string()))?;
        if server.is_empty() {
            return Err(Error::InvalidJid(s.to_string()));
        }
        // Drop any device suffix ("123:4@s.whatsapp.net").
        let user = user.split_once(':').map_or(user, |(u, _)| u);
        Ok(Self::new(user, server))
    }
}

impl TryFrom<String> for Jid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

// ============================================================================
// MESSAGE CONTENT
// ============================================================================

/// Descriptor for a media payload. Opaque to the relay; handed back to the
/// protocol client to download the raw bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
}

/// The message being replied to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    #[serde(default)]
    pub stanza_id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl QuotedMessage {
    /// Plain text of the quoted message, empty if it had none.
    pub fn text_content(&self) -> &str {
        match (&self.conversation, &self.text) {
            (Some(c), _) if !c.is_empty() => c.as_str(),
            (_, Some(t)) => t.as_str(),
            _ => "",
        }
    }
}

/// Extended (formatted / reply) text payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quoted: Option<QuotedMessage>,
}

/// Decoded message body. Only the parts the relay consumes are modeled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_text: Option<ExtendedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<MediaAttachment>,
}

impl MessageContent {
    /// Plain text: the conversation string, else the extended text, else empty.
    pub fn text_content(&self) -> &str {
        if let Some(text) = self.conversation.as_deref() {
            if !text.is_empty() {
                return text;
            }
        }
        self.extended_text
            .as_ref()
            .and_then(|ext| ext.text.as_deref())
            .unwrap_or("")
    }

    /// The quoted message, if this is a reply.
    pub fn quoted(&self) -> Option<&QuotedMessage> {
        self.extended_text.as_ref().and_then(|ext| ext.quoted.as_ref())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Envelope metadata of a live message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    #[serde(default)]
    pub is_from_me: bool,
    pub timestamp: DateTime<Utc>,
}

/// A live inbound or outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub info: MessageInfo,
    #[serde(default)]
    pub message: MessageContent,
}

/// Delivery / read receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    pub chat: Jid,
    pub sender: Jid,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub receipt_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Group naming carried by a history-sync conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl GroupMetadata {
    /// First non-empty of display name, then name.
    pub fn best_name(&self) -> Option<&str> {
        [self.display_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .find(|n| !n.is_empty())
    }
}

/// Key of a historical message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageKey {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from_me: Option<bool>,
    #[serde(default)]
    pub participant: Option<String>,
}

/// One message inside a history-sync conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub key: Option<MessageKey>,
    #[serde(default)]
    pub message: Option<MessageContent>,
    /// Epoch seconds; zero when the record carries none.
    #[serde(default)]
    pub timestamp: u64,
}

/// One conversation inside a history-sync payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryConversation {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Option<GroupMetadata>,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

/// Bulk backfill payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySync {
    #[serde(default)]
    pub conversations: Vec<HistoryConversation>,
}

/// Everything the protocol client can deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Message(MessageEvent),
    Receipt(ReceiptEvent),
    HistorySync(HistorySync),
    Connected,
    LoggedOut,
}

/// Result of an outbound send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// COLLABORATOR TRAIT
// ============================================================================

/// Calls the relay makes into the messaging-protocol client.
#[async_trait]
pub trait ChatProtocol: Send + Sync {
    /// The local account's identifier.
    async fn own_jid(&self) -> Result<Jid>;

    /// Whether the messaging session is currently up.
    async fn is_connected(&self) -> bool;

    /// Live group subject, `None` when the group has none.
    async fn group_name(&self, group: &Jid) -> Result<Option<String>>;

    /// Contact's full name from the address book, `None` when unknown.
    async fn contact_full_name(&self, jid: &Jid) -> Result<Option<String>>;

    /// Download and decrypt the raw bytes behind a media descriptor.
    async fn download(&self, media: &MediaAttachment) -> Result<Vec<u8>>;

    async fn send_text(&self, to: &Jid, text: &str) -> Result<SendReceipt>;

    async fn send_image(
        &self,
        to: &Jid,
        caption: &str,
        image: Vec<u8>,
        mimetype: &str,
    ) -> Result<SendReceipt>;

    async fn send_document(
        &self,
        to: &Jid,
        caption: &str,
        document: Vec<u8>,
        file_name: &str,
        mimetype: &str,
    ) -> Result<SendReceipt>;
}

// ============================================================================
// TESTS
// ============================================================================
