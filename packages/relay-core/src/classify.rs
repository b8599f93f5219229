//! Event classification.
//!
//! Turns protocol events into what the rest of the pipeline consumes: a
//! message record for local history and the envelopes to queue. Nothing here
//! does I/O; media bytes are fetched by the pipeline from the
//! [`PendingMedia`] entries.

use chrono::{DateTime, Utc};

use crate::envelope::{EnvelopeKind, QueueEnvelope};
use crate::error::{Error, Result};
use crate::protocol::{
    GroupMetadata, HistoryConversation, HistoryMessage, Jid, MediaAttachment, MessageEvent,
    MessageInfo,
};
use crate::time::{from_unix_secs, truncate_to_millis};

/// A media attachment waiting for download and blob upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMedia {
    pub kind: EnvelopeKind,
    pub attachment: MediaAttachment,
    envelope: QueueEnvelope,
}

impl PendingMedia {
    /// The envelope to enqueue once the blob is reachable at `blob_url`.
    pub fn into_envelope(self, blob_url: impl Into<String>) -> QueueEnvelope {
        QueueEnvelope {
            blob_url: blob_url.into(),
            ..self.envelope
        }
    }

    /// Name hint for the stored blob.
    pub fn file_name(&self) -> &str {
        self.attachment.file_name.as_deref().unwrap_or_default()
    }

    pub fn mimetype(&self) -> &str {
        self.attachment
            .mimetype
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// A classified live message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedMessage {
    pub chat: Jid,
    pub message_id: String,
    /// Sender's user part, as stored in history.
    pub sender: String,
    /// Plain text; empty for media-only messages.
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    /// Text and quoted-text envelopes, ready to enqueue.
    pub envelopes: Vec<QueueEnvelope>,
    pub media: Vec<PendingMedia>,
}

impl ClassifiedMessage {
    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }
}

/// Whether the event belongs to the status-broadcast pseudo-chat.
pub fn is_status_event(info: &MessageInfo) -> bool {
    info.sender.is_status() || info.chat.is_status()
}

/// Backend sender and recipient for a live message.
///
/// Groups: the participant sends to the full group identifier. One-to-one:
/// the local account and the counterpart, oriented by `is_from_me`.
pub fn endpoints(info: &MessageInfo, own: &Jid) -> (String, String) {
    if info.chat.is_group() {
        (info.sender.user.clone(), info.chat.to_string())
    } else if info.is_from_me {
        (own.user.clone(), info.chat.user.clone())
    } else {
        (info.chat.user.clone(), own.user.clone())
    }
}

/// Classify a live message. `None` means the event is dropped entirely.
pub fn classify_message(event: &MessageEvent, own: &Jid) -> Option<ClassifiedMessage> {
    let info = &event.info;
    if is_status_event(info) {
        return None;
    }

    let (from, to) = endpoints(info, own);
    let timestamp = truncate_to_millis(info.timestamp);
    let base = |kind: EnvelopeKind, body: &str| {
        QueueEnvelope {
            kind,
            ..QueueEnvelope::text(from.as_str(), to.as_str(), body, timestamp)
        }
        .with_admin_phone(own.user.as_str())
    };

    let text = event.message.text_content().to_string();
    let mut envelopes = Vec::new();
    if !text.is_empty() {
        envelopes.push(base(EnvelopeKind::Text, &text).with_message_id(info.id.as_str()));
    }

    // Replies also relay the quoted text on its own, without parent linkage.
    if let Some(quoted) = event.message.quoted() {
        let quoted_text = quoted.text_content();
        if !quoted_text.is_empty() {
            let mut envelope = base(EnvelopeKind::Text, quoted_text);
            if let Some(stanza_id) = quoted.stanza_id.as_deref() {
                envelope = envelope.with_message_id(stanza_id);
            }
            envelopes.push(envelope);
        }
    }

    let mut media = Vec::new();
    let attachments = [
        (EnvelopeKind::Image, &event.message.image),
        (EnvelopeKind::Document, &event.message.document),
    ];
    for (kind, attachment) in attachments {
        if let Some(attachment) = attachment {
            let caption = attachment.caption.as_deref().unwrap_or_default();
            media.push(PendingMedia {
                kind,
                attachment: attachment.clone(),
                envelope: base(kind, caption).with_message_id(info.id.as_str()),
            });
        }
    }

    Some(ClassifiedMessage {
        chat: info.chat.clone(),
        message_id: info.id.clone(),
        sender: info.sender.user.clone(),
        text,
        timestamp,
        is_from_me: info.is_from_me,
        envelopes,
        media,
    })
}

// ============================================================================
// HISTORY SYNC
// ============================================================================

/// A historical text message ready for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
}

/// One classified history-sync conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
    pub chat: Jid,
    pub metadata: Option<GroupMetadata>,
    /// Newest usable timestamp in the conversation.
    pub latest: Option<DateTime<Utc>>,
    pub messages: Vec<HistoryRecord>,
}

/// Classify a history-sync conversation.
///
/// Text only; media is not re-fetched for backfill. Messages without a
/// timestamp, id or text are skipped. Returns `Ok(None)` for status chats.
pub fn classify_history(
    conversation: &HistoryConversation,
    own: &Jid,
) -> Result<Option<HistoryBatch>> {
    let id = conversation
        .id
        .as_deref()
        .ok_or_else(|| Error::InvalidJid("history conversation without id".into()))?;
    let chat: Jid = id.parse()?;
    if chat.is_status() {
        return Ok(None);
    }

    let latest = conversation
        .messages
        .iter()
        .filter_map(|m| from_unix_secs(m.timestamp))
        .max();

    let messages = conversation
        .messages
        .iter()
        .filter_map(|m| history_record(m, &chat, own))
        .collect();

    Ok(Some(HistoryBatch {
        chat,
        metadata: conversation.metadata.clone(),
        latest,
        messages,
    }))
}

fn history_record(message: &HistoryMessage, chat: &Jid, own: &Jid) -> Option<HistoryRecord> {
    let timestamp = from_unix_secs(message.timestamp)?;
    let text = message.message.as_ref()?.text_content();
    if text.is_empty() {
        return None;
    }
    let key = message.key.as_ref();
    let id = key.and_then(|k| k.id.as_deref()).filter(|id| !id.is_empty())?;

    let is_from_me = key.and_then(|k| k.from_me).unwrap_or(false);
    let participant = key
        .and_then(|k| k.participant.as_deref())
        .filter(|p| !p.is_empty());
    let sender = if is_from_me {
        own.user.clone()
    } else if let Some(participant) = participant {
        participant
            .parse::<Jid>()
            .map(|jid| jid.user)
            .unwrap_or_else(|_| participant.to_string())
    } else {
        chat.user.clone()
    };

    Some(HistoryRecord {
        id: id.to_string(),
        sender,
        text: text.to_string(),
        timestamp,
        is_from_me,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExtendedText, MessageContent, MessageKey, QuotedMessage};
    use crate::time::from_millis;

    fn own() -> Jid {
        Jid::phone("15559990000")
    }

    fn event(chat: Jid, sender: Jid, is_from_me: bool, message: MessageContent) -> MessageEvent {
        MessageEvent {
            info: MessageInfo {
                id: "MSG1".into(),
                chat,
                sender,
                is_from_me,
                timestamp: from_millis(1_714_557_600_000),
            },
            message,
        }
    }

    fn text(body: &str) -> MessageContent {
        MessageContent {
            conversation: Some(body.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_inbound_direct_text() {
        let peer = Jid::phone("15551234567");
        let classified = classify_message(&event(peer.clone(), peer, false, text("hi")), &own())
            .unwrap();

        assert!(classified.has_text());
        assert_eq!(classified.sender, "15551234567");
        assert_eq!(classified.envelopes.len(), 1);
        let envelope = &classified.envelopes[0];
        assert_eq!(envelope.kind, EnvelopeKind::Text);
        assert_eq!(envelope.from, "15551234567");
        assert_eq!(envelope.to, "15559990000");
        assert_eq!(envelope.body, "hi");
        assert_eq!(envelope.message_id, "MSG1");
        assert_eq!(envelope.admin_phone, "15559990000");
        assert!(classified.media.is_empty());
    }

    #[test]
    fn test_outbound_direct_text_reverses_endpoints() {
        let peer = Jid::phone("15551234567");
        let classified =
            classify_message(&event(peer, own(), true, text("hello")), &own()).unwrap();
        let envelope = &classified.envelopes[0];
        assert_eq!(envelope.from, "15559990000");
        assert_eq!(envelope.to, "15551234567");
    }

    #[test]
    fn test_group_endpoints() {
        let group = Jid::new("120363041234", "g.us");
        let member = Jid::phone("15551234567");
        let classified =
            classify_message(&event(group, member, false, text("hey all")), &own()).unwrap();
        let envelope = &classified.envelopes[0];
        assert_eq!(envelope.from, "15551234567");
        assert_eq!(envelope.to, "120363041234@g.us");
    }

    #[test]
    fn test_status_broadcast_dropped() {
        let status = Jid::new("status", "broadcast");
        let peer = Jid::phone("15551234567");
        assert!(classify_message(&event(status, peer.clone(), false, text("story")), &own())
            .is_none());
        assert!(
            classify_message(&event(peer, Jid::new("status", "broadcast"), false, text("x")), &own())
                .is_none()
        );
    }

    #[test]
    fn test_reply_adds_quoted_envelope() {
        let peer = Jid::phone("15551234567");
        let message = MessageContent {
            extended_text: Some(ExtendedText {
                text: Some("agreed".into()),
                quoted: Some(QuotedMessage {
                    stanza_id: Some("ORIG".into()),
                    conversation: Some("ship it?".into()),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };
        let classified = classify_message(&event(peer.clone(), peer, false, message), &own())
            .unwrap();

        assert_eq!(classified.text, "agreed");
        assert_eq!(classified.envelopes.len(), 2);
        assert_eq!(classified.envelopes[1].body, "ship it?");
        assert_eq!(classified.envelopes[1].message_id, "ORIG");
        assert!(classified.envelopes.iter().all(|e| e.parent_message_id.is_none()));
    }

    #[test]
    fn test_media_only_message() {
        let peer = Jid::phone("15551234567");
        let message = MessageContent {
            document: Some(MediaAttachment {
                direct_path: Some("/v/doc".into()),
                mimetype: Some("application/pdf".into()),
                file_name: Some("invoice.pdf".into()),
                caption: Some("March".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let classified = classify_message(&event(peer.clone(), peer, false, message), &own())
            .unwrap();

        assert!(!classified.has_text());
        assert!(classified.envelopes.is_empty());
        assert_eq!(classified.media.len(), 1);

        let pending = classified.media[0].clone();
        assert_eq!(pending.file_name(), "invoice.pdf");
        assert_eq!(pending.mimetype(), "application/pdf");
        let envelope = pending.into_envelope("http://blobs/media/abc.pdf");
        assert_eq!(envelope.kind, EnvelopeKind::Document);
        assert_eq!(envelope.body, "March");
        assert_eq!(envelope.blob_url, "http://blobs/media/abc.pdf");
    }

    fn history_message(id: &str, body: &str, ts: u64, key: MessageKey) -> HistoryMessage {
        HistoryMessage {
            key: Some(MessageKey {
                id: Some(id.into()),
                ..key
            }),
            message: Some(text(body)),
            timestamp: ts,
        }
    }

    #[test]
    fn test_history_sender_rules_and_skips() {
        let conversation = HistoryConversation {
            id: Some("120363041234@g.us".into()),
            metadata: Some(GroupMetadata {
                display_name: Some("Team".into()),
                name: None,
            }),
            messages: vec![
                history_message(
                    "h1",
                    "mine",
                    1_700_000_300,
                    MessageKey {
                        from_me: Some(true),
                        participant: Some("15551234567@s.whatsapp.net".into()),
                        ..Default::default()
                    },
                ),
                history_message(
                    "h2",
                    "theirs",
                    1_700_000_200,
                    MessageKey {
                        participant: Some("15551234567@s.whatsapp.net".into()),
                        ..Default::default()
                    },
                ),
                history_message("h3", "anon", 1_700_000_100, MessageKey::default()),
                history_message("h4", "no time", 0, MessageKey::default()),
                history_message("h5", "", 1_700_000_400, MessageKey::default()),
            ],
        };

        let batch = classify_history(&conversation, &own()).unwrap().unwrap();
        assert!(batch.chat.is_group());
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(batch.messages[0].sender, "15559990000");
        assert!(batch.messages[0].is_from_me);
        assert_eq!(batch.messages[1].sender, "15551234567");
        assert_eq!(batch.messages[2].sender, "120363041234");
        assert_eq!(batch.latest.unwrap().timestamp(), 1_700_000_400);
    }

    #[test]
    fn test_history_rejects_bad_ids() {
        let missing = HistoryConversation::default();
        assert!(classify_history(&missing, &own()).is_err());

        let status = HistoryConversation {
            id: Some("status@broadcast".into()),
            ..Default::default()
        };
        assert!(classify_history(&status, &own()).unwrap().is_none());
    }
}
