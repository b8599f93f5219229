//! Queue producer.

use std::sync::Arc;

use super::QueueBackend;
use crate::blob::BlobStore;
use crate::envelope::QueueEnvelope;
use crate::error::{Error, Result};

/// Serializes envelopes onto the relay queue.
///
/// Media envelopes go through [`Producer::enqueue_with_blob`] so the blob is
/// stored before anything referencing it is queued.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<dyn QueueBackend>,
    blobs: Arc<dyn BlobStore>,
}

impl Producer {
    pub fn new(queue: Arc<dyn QueueBackend>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { queue, blobs }
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Enqueue a ready envelope; returns the queue entry id.
    pub async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<String> {
        if envelope.kind.has_blob() && envelope.blob_url.is_empty() {
            return Err(Error::Validation(format!(
                "{} envelope must reference an uploaded blob",
                envelope.kind
            )));
        }

        let body = envelope.encode()?;
        let id = self.queue.send(&body).await?;
        tracing::info!(
            entry_id = %id,
            kind = %envelope.kind,
            message_id = %envelope.message_id,
            from = %envelope.from,
            to = %envelope.to,
            "Envelope enqueued"
        );
        Ok(id)
    }

    /// Upload media bytes, point the envelope at the stored blob and enqueue
    /// it. Returns the envelope as queued.
    ///
    /// If the upload succeeds but the enqueue fails, the blob stays in the
    /// store and the error is returned for the caller to log.
    pub async fn enqueue_with_blob(
        &self,
        mut envelope: QueueEnvelope,
        key_hint: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<QueueEnvelope> {
        envelope.blob_url = self.blobs.put(key_hint, bytes, content_type).await?;

        if let Err(e) = self.enqueue(&envelope).await {
            tracing::warn!(
                blob_url = %envelope.blob_url,
                message_id = %envelope.message_id,
                error = %e,
                "Blob uploaded but envelope was not enqueued"
            );
            return Err(e);
        }
        Ok(envelope)
    }
}
