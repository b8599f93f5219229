//! In-memory `ChatProtocol`.
//!
//! Serves names and media from maps and records every send. Used by tests
//! and for running the relay without a paired session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{ChatProtocol, Jid, MediaAttachment, SendReceipt};
use crate::error::{Error, Result};
use crate::time::now_millis_precision;

/// An outbound call captured by [`InMemoryProtocol`].
#[derive(Debug, Clone, PartialEq)]
pub enum SentMessage {
    Text { to: Jid, text: String },
    Image { to: Jid, caption: String, bytes: usize },
    Document { to: Jid, caption: String, file_name: String, bytes: usize },
}

pub struct InMemoryProtocol {
    own: Jid,
    connected: AtomicBool,
    fail_group_lookups: AtomicBool,
    groups: RwLock<HashMap<Jid, String>>,
    contacts: RwLock<HashMap<Jid, String>>,
    /// Keyed by the attachment's `direct_path`.
    media: RwLock<HashMap<String, Vec<u8>>>,
    sent: Mutex<Vec<SentMessage>>,
    next_id: AtomicU64,
}

impl InMemoryProtocol {
    pub fn new(own: Jid) -> Self {
        Self {
            own,
            connected: AtomicBool::new(true),
            fail_group_lookups: AtomicBool::new(false),
            groups: RwLock::new(HashMap::new()),
            contacts: RwLock::new(HashMap::new()),
            media: RwLock::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every `group_name` call fail with a protocol error.
    pub fn fail_group_lookups(&self, fail: bool) {
        self.fail_group_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn add_group(&self, jid: Jid, name: impl Into<String>) {
        self.groups.write().insert(jid, name.into());
    }

    pub fn add_contact(&self, jid: Jid, full_name: impl Into<String>) {
        self.contacts.write().insert(jid, full_name.into());
    }

    pub fn add_media(&self, direct_path: impl Into<String>, bytes: Vec<u8>) {
        self.media.write().insert(direct_path.into(), bytes);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    fn record(&self, message: SentMessage) -> Result<SendReceipt> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.sent.lock().push(message);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt {
            id: format!("MEM{:08X}", id),
            timestamp: now_millis_precision(),
        })
    }
}

#[async_trait]
impl ChatProtocol for InMemoryProtocol {
    async fn own_jid(&self) -> Result<Jid> {
        Ok(self.own.clone())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn group_name(&self, group: &Jid) -> Result<Option<String>> {
        if self.fail_group_lookups.load(Ordering::SeqCst) {
            return Err(Error::ProtocolError(format!("group lookup failed for {}", group)));
        }
        Ok(self.groups.read().get(group).cloned())
    }

    async fn contact_full_name(&self, jid: &Jid) -> Result<Option<String>> {
        Ok(self.contacts.read().get(jid).cloned())
    }

    async fn download(&self, media: &MediaAttachment) -> Result<Vec<u8>> {
        let key = media.direct_path.as_deref().unwrap_or_default();
        self.media
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ProtocolError(format!("no media at {:?}", key)))
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<SendReceipt> {
        self.record(SentMessage::Text {
            to: to.clone(),
            text: text.to_string(),
        })
    }

    async fn send_image(
        &self,
        to: &Jid,
        caption: &str,
        image: Vec<u8>,
        _mimetype: &str,
    ) -> Result<SendReceipt> {
        self.record(SentMessage::Image {
            to: to.clone(),
            caption: caption.to_string(),
            bytes: image.len(),
        })
    }

    async fn send_document(
        &self,
        to: &Jid,
        caption: &str,
        document: Vec<u8>,
        file_name: &str,
        _mimetype: &str,
    ) -> Result<SendReceipt> {
        self.record(SentMessage::Document {
            to: to.clone(),
            caption: caption.to_string(),
            file_name: file_name.to_string(),
            bytes: document.len(),
        })
    }
}
