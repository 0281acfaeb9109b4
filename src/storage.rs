//! Content-addressable audio storage behind the [`BlobStore`] seam.
//!
//! Keys are derived deterministically from (document id, chunk index), so
//! re-processing the same document finds and reuses prior audio instead of
//! paying a provider twice.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Deterministic object key for a document chunk's audio.
pub fn audio_key(doc_id: &str, index: usize) -> String {
    format!("audio/{}_chunk_{}.mp3", doc_id, index)
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `key` and return the public URL.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PipelineError>;

    /// Fetch bytes for `key`, or `None` when no object exists.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError>;

    /// Public URL an existing object is served under. Deterministic in `key`
    /// so a cache hit can report the URL without re-uploading.
    fn url_of(&self, key: &str) -> String;
}

/// Filesystem-backed store: objects live under a root directory and are
/// served by an external static-file layer at `public_base_url`.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            PipelineError::Storage(format!("failed to write {}: {}", path.display(), e))
        })?;
        Ok(self.url_of(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn url_of(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

/// In-memory store for tests and ephemeral runs. Tracks how many writes it
/// has seen so tests can assert single-flight behavior.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `put` calls observed.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.write().await;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(self.url_of(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).cloned())
    }

    fn url_of(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_keys_are_deterministic() {
        assert_eq!(audio_key("doc1", 0), "audio/doc1_chunk_0.mp3");
        assert_eq!(audio_key("doc1", 0), audio_key("doc1", 0));
        assert_ne!(audio_key("doc1", 0), audio_key("doc2", 0));
    }

    #[tokio::test]
    async fn fs_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "http://localhost:8080/uploads/");
        let key = audio_key("doc1", 3);

        assert_eq!(store.get(&key).await.unwrap(), None);

        let url = store.put(&key, b"mp3-bytes").await.unwrap();
        assert_eq!(url, "http://localhost:8080/uploads/audio/doc1_chunk_3.mp3");
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"mp3-bytes"[..]));
        assert_eq!(store.url_of(&key), url);
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryBlobStore::new();
        let key = audio_key("doc1", 0);
        store.put(&key, b"a").await.unwrap();
        store.put(&key, b"b").await.unwrap();
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"b"[..]));
    }
}
