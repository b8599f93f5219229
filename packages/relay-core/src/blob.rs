//! Blob object store for relayed media.
//!
//! Media bytes are uploaded here before their envelope is queued, and the
//! forwarder fetches them back by URL. The file-backed store keeps blobs at
//! `{root}/blobs/{bucket}/{sha256}.{ext}`; identical content maps to the same
//! file and URL.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::error::{Error, Result};

/// Upload side of an object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return a URL the forwarder can GET.
    ///
    /// `key_hint` is the original file name, if any; only its extension is
    /// used, when the content type does not determine one.
    async fn put(&self, key_hint: &str, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Metadata about a stored blob.
#[derive(Debug, Clone, Serialize)]
pub struct BlobMeta {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// File-backed blob store.
#[derive(Clone)]
pub struct FileBlobStore {
    /// Maps filename → BlobMeta
    meta: Arc<DashMap<String, BlobMeta>>,
    bucket_dir: PathBuf,
    bucket: String,
    public_url: String,
}

impl FileBlobStore {
    pub fn new(config: &BlobConfig) -> Self {
        Self {
            meta: Arc::new(DashMap::new()),
            bucket_dir: config.root.join("blobs").join(&config.bucket),
            bucket: config.bucket.clone(),
            public_url: config.public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Public URL of a stored file.
    pub fn url_for(&self, filename: &str) -> String {
        format!("{}/blobs/{}/{}", self.public_url, self.bucket, filename)
    }

    /// Load existing blobs from disk into the metadata cache.
    pub fn load_from_disk(&self) -> usize {
        let entries = match std::fs::read_dir(&self.bucket_dir) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, "Failed to read blob directory");
                }
                return 0;
            }
        };

        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().map(|f| f.to_string_lossy().to_string()) else {
                continue;
            };
            if filename.ends_with(".tmp") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("bin");

            self.meta.insert(
                filename.clone(),
                BlobMeta {
                    filename,
                    content_type: content_type_for_extension(ext).to_string(),
                    size,
                },
            );
            count += 1;
        }
        count
    }

    /// Store bytes, returning the blob's metadata. Deduplicates by hash.
    pub fn store(&self, key_hint: &str, data: &[u8], content_type: &str) -> Result<BlobMeta> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash = hex::encode(hasher.finalize());

        let ext = extension_for(content_type, key_hint);
        let filename = format!("{}.{}", hash, ext);

        if let Some(existing) = self.meta.get(&filename) {
            return Ok(existing.value().clone());
        }

        std::fs::create_dir_all(&self.bucket_dir).map_err(|e| {
            Error::BlobStoreError(format!("Failed to create {}: {}", self.bucket_dir.display(), e))
        })?;

        // Atomic: write to .tmp, then rename
        let file_path = self.bucket_dir.join(&filename);
        let tmp_path = file_path.with_extension(format!("{}.tmp", ext));
        std::fs::write(&tmp_path, data)
            .map_err(|e| Error::BlobStoreError(format!("Failed to write blob: {}", e)))?;
        if let Err(e) = std::fs::rename(&tmp_path, &file_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(Error::BlobStoreError(format!("Failed to finalize blob: {}", e)));
        }

        let meta = BlobMeta {
            filename: filename.clone(),
            content_type: content_type.to_string(),
            size: data.len() as u64,
        };
        self.meta.insert(filename, meta.clone());

        tracing::info!(
            bucket = %self.bucket,
            hash = %hash,
            size = data.len(),
            content_type,
            "Blob stored"
        );
        Ok(meta)
    }

    /// Read a blob back. `None` for unknown buckets or files.
    pub fn get(&self, bucket: &str, filename: &str) -> Option<(Vec<u8>, String)> {
        if bucket != self.bucket || filename.contains('/') || filename.contains("..") {
            return None;
        }
        let content_type = self.meta.get(filename)?.content_type.clone();
        let data = std::fs::read(self.bucket_dir.join(filename)).ok()?;
        Some((data, content_type))
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key_hint: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let meta = self.store(key_hint, bytes, content_type)?;
        Ok(self.url_for(&meta.filename))
    }
}

fn extension_for(content_type: &str, key_hint: &str) -> String {
    let known = match content_type {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        _ => None,
    };
    if let Some(ext) = known {
        return ext.to_string();
    }

    key_hint
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

fn content_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> FileBlobStore {
        FileBlobStore::new(&BlobConfig {
            root: dir.to_path_buf(),
            bucket: "media".into(),
            public_url: "http://127.0.0.1:6000/".into(),
        })
    }

    #[tokio::test]
    async fn test_put_returns_public_url_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let url = store.put("photo.jpg", b"jpeg bytes", "image/jpeg").await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:6000/blobs/media/"));
        assert!(url.ends_with(".jpg"));

        let again = store.put("other-name.jpg", b"jpeg bytes", "image/jpeg").await.unwrap();
        assert_eq!(url, again);
        assert_eq!(store.len(), 1);

        let filename = url.rsplit('/').next().unwrap();
        assert!(dir.path().join("blobs/media").join(filename).exists());
    }

    #[test]
    fn test_extension_from_hint_when_type_unknown() {
        assert_eq!(extension_for("application/pdf", "x.docx"), "pdf");
        assert_eq!(
            extension_for("application/vnd.openxmlformats", "Report.DOCX"),
            "docx"
        );
        assert_eq!(extension_for("application/octet-stream", ""), "bin");
        assert_eq!(extension_for("application/octet-stream", "weird.../x"), "bin");
    }

    #[test]
    fn test_get_rejects_traversal_and_other_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let meta = store.store("", b"data", "text/plain").unwrap();

        let (data, content_type) = store.get("media", &meta.filename).unwrap();
        assert_eq!(data, b"data");
        assert_eq!(content_type, "text/plain");

        assert!(store.get("other", &meta.filename).is_none());
        assert!(store.get("media", "../secrets").is_none());
        assert!(store.get("media", "missing.txt").is_none());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let meta = store_in(dir.path()).store("", b"%PDF", "application/pdf").unwrap();

        let reopened = store_in(dir.path());
        assert_eq!(reopened.load_from_disk(), 1);
        let (_, content_type) = reopened.get("media", &meta.filename).unwrap();
        assert_eq!(content_type, "application/pdf");
    }
}
