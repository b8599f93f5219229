//! Event pipeline.
//!
//! Routes protocol events through classification into the two independent
//! sinks: local history and the relay queue. A failure in one sink is logged
//! and never stops the other.
//!
//! ```text
//!                       ┌──► resolve name ──► Database (chat + message)
//! ProtocolEvent ──► classify
//!                       └──► download media ──► BlobStore ──► Producer ──► queue
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::classify::{classify_history, classify_message, ClassifiedMessage};
use crate::envelope::{EnvelopeKind, QueueEnvelope};
use crate::error::Result;
use crate::names::resolve_chat_name;
use crate::protocol::{ChatProtocol, HistorySync, Jid, MessageEvent, ProtocolEvent, SendReceipt};
use crate::queue::Producer;
use crate::storage::Database;

/// Counters exposed through the stats endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub messages: AtomicU64,
    pub dropped: AtomicU64,
    pub enqueued: AtomicU64,
    pub enqueue_failures: AtomicU64,
    pub history_messages: AtomicU64,
    pub receipts: AtomicU64,
    pub connected: AtomicBool,
}

/// What happened to one live message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOutcome {
    /// Status-broadcast traffic, ignored entirely.
    pub dropped: bool,
    pub stored: bool,
    pub enqueued: usize,
    /// Envelopes lost from the relay path (download, upload or enqueue failed).
    pub failed: usize,
}

/// Media attached to an outbound send.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMedia<'a> {
    pub kind: EnvelopeKind,
    pub file_name: &'a str,
    pub bytes: &'a [u8],
    pub mimetype: &'a str,
}

#[derive(Clone)]
pub struct EventPipeline {
    db: Database,
    producer: Producer,
    protocol: Arc<dyn ChatProtocol>,
    stats: Arc<PipelineStats>,
}

impl EventPipeline {
    pub fn new(db: Database, producer: Producer, protocol: Arc<dyn ChatProtocol>) -> Self {
        Self {
            db,
            producer,
            protocol,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn protocol(&self) -> &Arc<dyn ChatProtocol> {
        &self.protocol
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Dispatch any protocol event.
    pub async fn handle_event(&self, event: ProtocolEvent) -> Result<()> {
        match event {
            ProtocolEvent::Message(message) => {
                self.handle_message(&message).await?;
            }
            ProtocolEvent::Receipt(receipt) => {
                self.stats.receipts.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    chat_jid = %receipt.chat,
                    sender = %receipt.sender,
                    receipt_type = %receipt.receipt_type,
                    count = receipt.message_ids.len(),
                    "Receipt"
                );
            }
            ProtocolEvent::HistorySync(sync) => {
                self.handle_history_sync(&sync).await?;
            }
            ProtocolEvent::Connected => {
                self.stats.connected.store(true, Ordering::Relaxed);
                tracing::info!("Connected to messaging network");
            }
            ProtocolEvent::LoggedOut => {
                self.stats.connected.store(false, Ordering::Relaxed);
                tracing::warn!("Device logged out; pairing required");
            }
        }
        Ok(())
    }

    /// Store and relay a live message.
    pub async fn handle_message(&self, event: &MessageEvent) -> Result<MessageOutcome> {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let own = self.protocol.own_jid().await?;
        let Some(classified) = classify_message(event, &own) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(message_id = %event.info.id, "Dropped status broadcast");
            return Ok(MessageOutcome {
                dropped: true,
                ..MessageOutcome::default()
            });
        };

        let mut outcome = MessageOutcome {
            stored: self.store_message(&classified).await,
            ..MessageOutcome::default()
        };

        for envelope in &classified.envelopes {
            match self.producer.enqueue(envelope).await {
                Ok(_) => outcome.enqueued += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(message_id = %classified.message_id, error = %e, "Failed to enqueue envelope");
                }
            }
        }

        for pending in classified.media {
            let bytes = match self.protocol.download(&pending.attachment).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        message_id = %classified.message_id,
                        kind = %pending.kind,
                        error = %e,
                        "Failed to download media"
                    );
                    continue;
                }
            };

            let file_name = pending.file_name().to_string();
            let mimetype = pending.mimetype().to_string();
            let kind = pending.kind;
            let envelope = pending.into_envelope(String::new());
            match self
                .producer
                .enqueue_with_blob(envelope, &file_name, &bytes, &mimetype)
                .await
            {
                Ok(_) => outcome.enqueued += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        message_id = %classified.message_id,
                        kind = %kind,
                        error = %e,
                        "Failed to relay media"
                    );
                }
            }
        }

        self.stats
            .enqueued
            .fetch_add(outcome.enqueued as u64, Ordering::Relaxed);
        self.stats
            .enqueue_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Write a classified text message to local history. Returns whether the
    /// message row was written.
    async fn store_message(&self, classified: &ClassifiedMessage) -> bool {
        if !classified.has_text() {
            return false;
        }
        let chat_jid = classified.chat.to_string();
        let name = resolve_chat_name(
            &self.db,
            self.protocol.as_ref(),
            &classified.chat,
            None,
            &classified.sender,
        )
        .await;

        if let Err(e) = self.db.record_chat_activity(&chat_jid, &name, classified.timestamp) {
            tracing::warn!(chat_jid = %chat_jid, error = %e, "Failed to store chat");
        }

        match self.db.upsert_message(
            &classified.message_id,
            &chat_jid,
            &classified.sender,
            &classified.text,
            classified.timestamp,
            classified.is_from_me,
        ) {
            Ok(written) => {
                tracing::info!(
                    chat_jid = %chat_jid,
                    message_id = %classified.message_id,
                    sender = %classified.sender,
                    from_me = classified.is_from_me,
                    "Message stored"
                );
                written
            }
            Err(e) => {
                tracing::warn!(message_id = %classified.message_id, error = %e, "Failed to store message");
                false
            }
        }
    }

    /// Backfill local history. Text only, nothing is queued. Returns the
    /// number of messages stored.
    pub async fn handle_history_sync(&self, sync: &HistorySync) -> Result<usize> {
        tracing::info!(
            conversations = sync.conversations.len(),
            "History sync received"
        );
        let own = self.protocol.own_jid().await?;

        let mut stored = 0;
        for conversation in &sync.conversations {
            let batch = match classify_history(conversation, &own) {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping history conversation");
                    continue;
                }
            };
            let Some(latest) = batch.latest else {
                continue;
            };

            let chat_jid = batch.chat.to_string();
            let name = resolve_chat_name(
                &self.db,
                self.protocol.as_ref(),
                &batch.chat,
                batch.metadata.as_ref(),
                "",
            )
            .await;
            if let Err(e) = self.db.record_chat_activity(&chat_jid, &name, latest) {
                tracing::warn!(chat_jid = %chat_jid, error = %e, "Failed to store chat");
            }

            for record in &batch.messages {
                match self.db.upsert_message(
                    &record.id,
                    &chat_jid,
                    &record.sender,
                    &record.text,
                    record.timestamp,
                    record.is_from_me,
                ) {
                    Ok(true) => stored += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(message_id = %record.id, error = %e, "Failed to store history message")
                    }
                }
            }
        }

        self.stats
            .history_messages
            .fetch_add(stored as u64, Ordering::Relaxed);
        tracing::info!(stored, "History sync complete");
        Ok(stored)
    }

    /// Record a message sent through the command surface: keep text in local
    /// history and relay it like any outbound event. Returns the queued
    /// envelope.
    pub async fn record_outbound(
        &self,
        to: &Jid,
        text: &str,
        receipt: &SendReceipt,
        media: Option<OutboundMedia<'_>>,
    ) -> Result<QueueEnvelope> {
        let own = self.protocol.own_jid().await?;
        let recipient = if to.is_group() {
            to.to_string()
        } else {
            to.user.clone()
        };

        if media.is_none() && !text.is_empty() {
            let chat_jid = to.to_string();
            let name = resolve_chat_name(&self.db, self.protocol.as_ref(), to, None, "").await;
            if let Err(e) = self.db.record_chat_activity(&chat_jid, &name, receipt.timestamp) {
                tracing::warn!(chat_jid = %chat_jid, error = %e, "Failed to store chat");
            }
            if let Err(e) =
                self.db
                    .upsert_message(&receipt.id, &chat_jid, &own.user, text, receipt.timestamp, true)
            {
                tracing::warn!(message_id = %receipt.id, error = %e, "Failed to store message");
            }
        }

        let result = match media {
            None => {
                let envelope = QueueEnvelope::text(own.user.as_str(), recipient, text, receipt.timestamp)
                    .with_message_id(receipt.id.as_str())
                    .with_admin_phone(own.user.as_str());
                self.producer.enqueue(&envelope).await.map(|_| envelope)
            }
            Some(media) => {
                let envelope = QueueEnvelope::media(
                    media.kind,
                    own.user.as_str(),
                    recipient,
                    text,
                    "",
                    receipt.timestamp,
                )
                .with_message_id(receipt.id.as_str())
                .with_admin_phone(own.user.as_str());
                self.producer
                    .enqueue_with_blob(envelope, media.file_name, media.bytes, media.mimetype)
                    .await
            }
        };

        match &result {
            Ok(_) => self.stats.enqueued.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.enqueue_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blob::FileBlobStore;
    use crate::config::{BlobConfig, QueueConfig};
    use crate::protocol::{
        GroupMetadata, HistoryConversation, HistoryMessage, InMemoryProtocol, MediaAttachment,
        MessageContent, MessageInfo, MessageKey,
    };
    use crate::queue::{QueueBackend, SqliteQueue};
    use crate::time::from_millis;

    struct Harness {
        pipeline: EventPipeline,
        queue: Arc<SqliteQueue>,
        protocol: Arc<InMemoryProtocol>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SqliteQueue::open(&QueueConfig::default()).unwrap());
        let blobs = Arc::new(FileBlobStore::new(&BlobConfig {
            root: dir.path().to_path_buf(),
            bucket: "media".into(),
            public_url: "http://127.0.0.1:6000".into(),
        }));
        let protocol = Arc::new(InMemoryProtocol::new(Jid::phone("15559990000")));
        let pipeline = EventPipeline::new(
            Database::open(None).unwrap(),
            Producer::new(queue.clone(), blobs),
            protocol.clone(),
        );
        Harness {
            pipeline,
            queue,
            protocol,
            _dir: dir,
        }
    }

    fn message(id: &str, chat: Jid, content: MessageContent) -> MessageEvent {
        MessageEvent {
            info: MessageInfo {
                id: id.into(),
                sender: chat.clone(),
                chat,
                is_from_me: false,
                timestamp: from_millis(1_714_557_600_000),
            },
            message: content,
        }
    }

    async fn queued(queue: &SqliteQueue) -> Vec<QueueEnvelope> {
        queue
            .receive(10, Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|e| QueueEnvelope::decode(&e.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_text_message_is_stored_and_queued() {
        let h = harness();
        let peer = Jid::phone("15551234567");
        h.protocol.add_contact(peer.clone(), "Alice");

        let outcome = h
            .pipeline
            .handle_message(&message(
                "M1",
                peer.clone(),
                MessageContent {
                    conversation: Some("hi".into()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(outcome.stored);
        assert_eq!(outcome.enqueued, 1);
        let db = h.pipeline.database();
        assert_eq!(db.get_chat_name(&peer.to_string()).unwrap().as_deref(), Some("Alice"));
        assert_eq!(db.get_messages(&peer.to_string(), 10).unwrap()[0].content, "hi");
        assert_eq!(queued(&h.queue).await[0].body, "hi");
    }

    #[tokio::test]
    async fn test_media_message_is_uploaded_then_queued() {
        let h = harness();
        h.protocol.add_media("/v/img", b"jpeg".to_vec());
        let peer = Jid::phone("15551234567");

        let outcome = h
            .pipeline
            .handle_message(&message(
                "M2",
                peer,
                MessageContent {
                    image: Some(MediaAttachment {
                        direct_path: Some("/v/img".into()),
                        mimetype: Some("image/jpeg".into()),
                        caption: Some("look".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(!outcome.stored);
        assert_eq!(outcome.enqueued, 1);
        let envelopes = queued(&h.queue).await;
        assert_eq!(envelopes[0].kind, EnvelopeKind::Image);
        assert_eq!(envelopes[0].body, "look");
        assert!(envelopes[0].blob_url.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_failed_download_loses_only_that_envelope() {
        let h = harness();
        let peer = Jid::phone("15551234567");

        let outcome = h
            .pipeline
            .handle_message(&message(
                "M3",
                peer,
                MessageContent {
                    conversation: Some("see attached".into()),
                    document: Some(MediaAttachment {
                        direct_path: Some("/v/missing".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(outcome.stored);
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn test_status_broadcast_is_ignored() {
        let h = harness();
        let outcome = h
            .pipeline
            .handle_message(&message(
                "S1",
                Jid::new("status", "broadcast"),
                MessageContent {
                    conversation: Some("story".into()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        assert!(outcome.dropped);
        assert_eq!(h.pipeline.database().chat_count().unwrap(), 0);
        assert_eq!(h.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_sync_stores_text_only() {
        let h = harness();
        let text = |body: &str| {
            Some(MessageContent {
                conversation: Some(body.into()),
                ..Default::default()
            })
        };
        let sync = HistorySync {
            conversations: vec![HistoryConversation {
                id: Some("120363041234@g.us".into()),
                metadata: Some(GroupMetadata {
                    display_name: Some("Team".into()),
                    name: None,
                }),
                messages: vec![
                    HistoryMessage {
                        key: Some(MessageKey {
                            id: Some("H1".into()),
                            ..Default::default()
                        }),
                        message: text("older"),
                        timestamp: 1_700_000_000,
                    },
                    HistoryMessage {
                        key: Some(MessageKey {
                            id: Some("H2".into()),
                            ..Default::default()
                        }),
                        message: text("newer"),
                        timestamp: 1_700_000_500,
                    },
                ],
            }],
        };

        let stored = h.pipeline.handle_history_sync(&sync).await.unwrap();
        assert_eq!(stored, 2);
        assert_eq!(h.queue.depth().await.unwrap(), 0);

        let chats = h.pipeline.database().get_chats().unwrap();
        assert_eq!(chats[0].name.as_deref(), Some("Team"));
        assert_eq!(chats[0].last_message_time.unwrap().timestamp(), 1_700_000_500);
    }

    #[tokio::test]
    async fn test_connection_events_update_stats() {
        let h = harness();
        h.pipeline.handle_event(ProtocolEvent::Connected).await.unwrap();
        assert!(h.pipeline.stats().connected.load(Ordering::Relaxed));
        h.pipeline.handle_event(ProtocolEvent::LoggedOut).await.unwrap();
        assert!(!h.pipeline.stats().connected.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_record_outbound_text() {
        let h = harness();
        let to = Jid::phone("15551234567");
        let receipt = SendReceipt {
            id: "OUT1".into(),
            timestamp: from_millis(5_000),
        };

        let envelope = h
            .pipeline
            .record_outbound(&to, "on my way", &receipt, None)
            .await
            .unwrap();
        assert_eq!(envelope.from, "15559990000");
        assert_eq!(envelope.to, "15551234567");
        assert_eq!(envelope.message_id, "OUT1");

        let stored = h.pipeline.database().get_messages(&to.to_string(), 10).unwrap();
        assert!(stored[0].is_from_me);
        assert_eq!(h.queue.depth().await.unwrap(), 1);
    }
}
