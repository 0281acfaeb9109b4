//! Per-document chunk state.
//!
//! A session owns the immutable chunk list for one submission of a document
//! and the mutable state table next to it. State reads take the shared lock;
//! the `Pending/Failed -> Generating` check-and-set and the transitions out
//! of `Generating` take the exclusive lock, held only for the in-memory
//! bookkeeping and never across a network call.

use crate::provider::{ProviderSettings, TtsProvider};
use crate::segmenter::Chunk;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Generating,
    /// Terminal. Re-requesting generation for a `Ready` chunk is a no-op.
    Ready(String),
    /// Cleared only by an explicit re-trigger (advance or generate).
    Failed(String),
}

/// Snapshot returned by a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    Ready {
        url: String,
        has_next: bool,
        next_ready: bool,
    },
    Generating,
    Pending,
    Failed {
        reason: String,
    },
    OutOfRange,
}

pub struct DocumentSession {
    doc_id: String,
    epoch: u64,
    created_at: Instant,
    chunks: Vec<Chunk>,
    settings: ProviderSettings,
    provider: Arc<dyn TtsProvider>,
    states: RwLock<Vec<ChunkState>>,
    last_error: RwLock<Option<String>>,
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("doc_id", &self.doc_id)
            .field("epoch", &self.epoch)
            .field("provider", &self.provider.id())
            .finish_non_exhaustive()
    }
}

impl DocumentSession {
    pub(crate) fn new(
        doc_id: &str,
        epoch: u64,
        chunks: Vec<Chunk>,
        settings: ProviderSettings,
        provider: Arc<dyn TtsProvider>,
    ) -> Self {
        let states = vec![ChunkState::Pending; chunks.len()];
        Self {
            doc_id: doc_id.to_string(),
            epoch,
            created_at: Instant::now(),
            chunks,
            settings,
            provider,
            states: RwLock::new(states),
            last_error: RwLock::new(None),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Generation epoch this session was created under. Tasks compare it
    /// against the registry's current session before writing results.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    pub(crate) fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub(crate) fn provider(&self) -> &Arc<dyn TtsProvider> {
        &self.provider
    }

    /// Side-effect-free state read under the shared lock.
    pub async fn status(&self, index: usize) -> ChunkStatus {
        let states = self.states.read().await;
        if index >= states.len() {
            return ChunkStatus::OutOfRange;
        }
        match &states[index] {
            ChunkState::Ready(url) => {
                let has_next = index + 1 < states.len();
                let next_ready =
                    has_next && matches!(states[index + 1], ChunkState::Ready(_));
                ChunkStatus::Ready {
                    url: url.clone(),
                    has_next,
                    next_ready,
                }
            }
            ChunkState::Generating => ChunkStatus::Generating,
            ChunkState::Pending => ChunkStatus::Pending,
            ChunkState::Failed(reason) => ChunkStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub(crate) async fn ready_count(&self) -> usize {
        let states = self.states.read().await;
        states
            .iter()
            .filter(|s| matches!(s, ChunkState::Ready(_)))
            .count()
    }

    /// Check-and-set `Pending/Failed -> Generating`. Returns false when the
    /// chunk is already `Ready` or `Generating` (or out of range), so no two
    /// callers can both observe `Pending` and both start work.
    pub(crate) async fn try_begin(&self, index: usize) -> bool {
        let mut states = self.states.write().await;
        match states.get(index) {
            Some(ChunkState::Pending) | Some(ChunkState::Failed(_)) => {
                states[index] = ChunkState::Generating;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn set_ready(&self, index: usize, url: String) {
        let mut states = self.states.write().await;
        states[index] = ChunkState::Ready(url);
    }

    pub(crate) async fn set_failed(&self, index: usize, reason: String) {
        {
            let mut states = self.states.write().await;
            states[index] = ChunkState::Failed(reason.clone());
        }
        let mut last_error = self.last_error.write().await;
        *last_error = Some(reason);
    }

    /// Used when a provider rejected the call as busy: the request was never
    /// attempted, so the chunk goes back to `Pending` instead of `Failed`.
    pub(crate) async fn reset_pending(&self, index: usize) {
        let mut states = self.states.write().await;
        states[index] = ChunkState::Pending;
    }
}
