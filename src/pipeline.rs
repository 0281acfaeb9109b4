//! Chunk processor and document-session registry.
//!
//! One [`ChunkPipeline`] serves many independent documents, keyed by id.
//! Submitting a document builds its provider up front (unknown identifiers
//! and missing credentials fail before anything is scheduled), records the
//! chunk texts in the ledger, and kicks off generation of the first two
//! chunks. From there the playback client drives the rolling buffer through
//! [`ChunkPipeline::advance_from`].

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::provider::{build_provider, ProviderSettings, SynthesisOptions};
use crate::segmenter::Chunk;
use crate::session::{ChunkStatus, DocumentSession};
use crate::storage::{audio_key, BlobStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Initial rolling-buffer depth: chunks 0 and 1 are scheduled at submission.
const INITIAL_BUFFER_DEPTH: usize = 2;

/// Wire shape for the status surface consumed by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// `"ready"`, `"processing"`, `"pending"`, or `"error"`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_next: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    fn from_status(status: ChunkStatus) -> Self {
        match status {
            ChunkStatus::Ready {
                url,
                has_next,
                next_ready,
            } => Self {
                status: "ready".to_string(),
                url: Some(url),
                has_next: Some(has_next),
                next_ready: Some(next_ready),
                error: None,
            },
            ChunkStatus::Generating => Self::bare("processing"),
            ChunkStatus::Pending => Self::bare("pending"),
            ChunkStatus::Failed { reason } => Self {
                status: "error".to_string(),
                url: None,
                has_next: None,
                next_ready: None,
                error: Some(reason),
            },
            ChunkStatus::OutOfRange => Self::bare("error"),
        }
    }

    fn bare(status: &str) -> Self {
        Self {
            status: status.to_string(),
            url: None,
            has_next: None,
            next_ready: None,
            error: None,
        }
    }
}

/// Document-level aggregate for dashboards and polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    pub total_chunks: usize,
    pub ready_chunks: usize,
    /// True while any chunk is still short of `Ready`.
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Keyed registry of document sessions plus the generation orchestrator.
#[derive(Clone)]
pub struct ChunkPipeline {
    sessions: Arc<RwLock<HashMap<String, Arc<DocumentSession>>>>,
    store: Arc<dyn BlobStore>,
    ledger: Arc<dyn Ledger>,
    retention: Duration,
    epochs: Arc<AtomicU64>,
}

impl ChunkPipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        ledger: Arc<dyn Ledger>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            ledger,
            retention: Duration::from_secs(config.retention_secs),
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Submit a document for processing. Replaces any existing session for
    /// the same id (tasks from the replaced session discard their results).
    /// Validation failures mean nothing was scheduled.
    pub async fn process_document(
        &self,
        doc_id: &str,
        chunks: Vec<Chunk>,
        settings: ProviderSettings,
    ) -> Result<Arc<DocumentSession>, PipelineError> {
        if chunks.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }
        let provider = build_provider(&settings)?;
        self.ledger.record_chunks(doc_id, &chunks).await?;

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(DocumentSession::new(
            doc_id, epoch, chunks, settings, provider,
        ));
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(doc_id.to_string(), session.clone());
        }
        info!(
            doc_id,
            epoch,
            chunks = session.chunk_count(),
            provider = session.provider().id(),
            "document session created"
        );

        for index in 0..INITIAL_BUFFER_DEPTH.min(session.chunk_count()) {
            self.schedule(&session, index);
        }
        Ok(session)
    }

    /// Status of one chunk, as served to the playback client.
    pub async fn get_status(
        &self,
        doc_id: &str,
        index: usize,
    ) -> Result<StatusResponse, PipelineError> {
        let session = self
            .session(doc_id)
            .await
            .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
        match session.status(index).await {
            ChunkStatus::OutOfRange => Err(PipelineError::OutOfRange {
                index,
                total: session.chunk_count(),
            }),
            status => Ok(StatusResponse::from_status(status)),
        }
    }

    /// Document-level aggregate status.
    pub async fn document_status(&self, doc_id: &str) -> Result<DocumentStatus, PipelineError> {
        let session = self
            .session(doc_id)
            .await
            .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
        let total_chunks = session.chunk_count();
        let ready_chunks = session.ready_count().await;
        Ok(DocumentStatus {
            total_chunks,
            ready_chunks,
            has_more: ready_chunks < total_chunks,
            last_error: session.last_error().await,
        })
    }

    /// Client-progress trigger. Idempotent and safe to call repeatedly:
    /// ensures `index` is scheduled if still pending (or failed, which is
    /// the explicit retry path), schedules `index + 1`, and once the client
    /// reports it is past the midpoint of `index`, also `index + 2`.
    pub async fn advance_from(
        &self,
        doc_id: &str,
        index: usize,
        past_midpoint: bool,
    ) -> Result<(), PipelineError> {
        let session = self
            .session(doc_id)
            .await
            .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
        let total = session.chunk_count();
        if index >= total {
            return Err(PipelineError::OutOfRange { index, total });
        }

        self.schedule(&session, index);
        if index + 1 < total {
            self.schedule(&session, index + 1);
        }
        if past_midpoint && index + 2 < total {
            self.schedule(&session, index + 2);
        }
        Ok(())
    }

    /// Explicitly drop a document session. In-flight tasks for it will
    /// notice on their epoch check and discard their results.
    pub async fn evict(&self, doc_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(doc_id).is_some()
    }

    /// Look up a session, applying per-entry retention lazily: an expired
    /// entry is removed on read instead of by a sweeping timer, so eviction
    /// never touches documents still in active use.
    async fn session(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(doc_id) {
                Some(session) if session.created_at().elapsed() <= self.retention => {
                    return Some(session.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(doc_id) {
            if session.created_at().elapsed() <= self.retention {
                return Some(session.clone());
            }
            info!(doc_id, "evicting expired document session");
            sessions.remove(doc_id);
        }
        None
    }

    fn schedule(&self, session: &Arc<DocumentSession>, index: usize) {
        let pipeline = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            pipeline.generate(session, index).await;
        });
    }

    /// Is `session` still the registry's current session for its document?
    async fn is_current(&self, session: &DocumentSession) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(session.doc_id())
            .map(|current| current.epoch() == session.epoch())
            .unwrap_or(false)
    }

    /// Idempotent generation for one chunk. At most one task passes the
    /// check-and-set per chunk; everyone else returns immediately.
    async fn generate(self, session: Arc<DocumentSession>, index: usize) {
        if !session.try_begin(index).await {
            return;
        }
        let doc_id = session.doc_id().to_string();
        let key = audio_key(&doc_id, index);

        // Cross-run reuse: an object stored by an earlier run (restart,
        // duplicate upload) means no provider call at all.
        match self.store.get(&key).await {
            Ok(Some(_)) => {
                if !self.is_current(&session).await {
                    debug!(doc_id, index, "session superseded, discarding result");
                    return;
                }
                let url = self.store.url_of(&key);
                debug!(doc_id, index, url, "reusing previously generated audio");
                if let Err(e) = self.ledger.set_audio_url(&doc_id, index, &url).await {
                    warn!(doc_id, index, error = %e, "ledger update failed");
                }
                session.set_ready(index, url).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(doc_id, index, error = %e, "blob store read failed, generating fresh audio");
            }
        }

        let options = SynthesisOptions {
            model: session.settings().model.clone(),
            voice: session.settings().voice.clone(),
            filename: Some(doc_id.clone()),
            chunk_index: Some(index),
        };
        let text = session.chunk(index).text.clone();
        debug!(
            doc_id,
            index,
            provider = session.provider().id(),
            words = session.chunk(index).word_count,
            "generating audio"
        );

        match session.provider().generate_audio(&text, &options).await {
            Ok(bytes) => {
                if !self.is_current(&session).await {
                    debug!(doc_id, index, "session superseded, discarding result");
                    return;
                }
                match self.store.put(&key, &bytes).await {
                    Ok(url) => {
                        if let Err(e) = self.ledger.set_audio_url(&doc_id, index, &url).await {
                            warn!(doc_id, index, error = %e, "ledger update failed");
                        }
                        info!(doc_id, index, url, "chunk audio ready");
                        session.set_ready(index, url).await;
                    }
                    Err(e) => {
                        error!(doc_id, index, error = %e, "failed to store audio");
                        session
                            .set_failed(index, format!("failed to store audio: {}", e))
                            .await;
                    }
                }
            }
            Err(e) if e.is_busy() => {
                // The provider never attempted the request; leave the chunk
                // retriable instead of recording a terminal failure.
                debug!(doc_id, index, "provider busy, chunk back to pending");
                session.reset_pending(index).await;
            }
            Err(e) => {
                error!(doc_id, index, error = %e, "audio generation failed");
                session.set_failed(index, e.to_string()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;
    use crate::provider::{CartesiaProvider, TtsProvider};
    use crate::storage::MemoryBlobStore;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> PipelineConfig {
        PipelineConfig::default()
    }

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                text: text.to_string(),
                word_count: text.split_whitespace().count(),
            })
            .collect()
    }

    fn elevenlabs_settings(server: &MockServer) -> ProviderSettings {
        let mut settings = ProviderSettings::new("elevenlabs");
        settings.api_key = Some("test-key".to_string());
        settings.base_url = Some(server.uri());
        settings
    }

    async fn test_pipeline() -> (ChunkPipeline, Arc<MemoryBlobStore>, Arc<SqliteLedger>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = Arc::new(MemoryBlobStore::new());
        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let pipeline = ChunkPipeline::new(store.clone(), ledger.clone(), &test_config());
        (pipeline, store, ledger)
    }

    async fn mount_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/text-to-speech/.+/stream$"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3".to_vec()))
            .mount(server)
            .await;
    }

    /// Poll a chunk until it settles into `expected`, or panic after 5s.
    async fn wait_for_status(pipeline: &ChunkPipeline, doc_id: &str, index: usize, expected: &str) {
        for _ in 0..500 {
            let status = pipeline.get_status(doc_id, index).await.unwrap();
            if status.status == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = pipeline.get_status(doc_id, index).await.unwrap();
        panic!(
            "chunk {} never reached {:?}, last status {:?}",
            index, expected, status
        );
    }

    #[tokio::test]
    async fn submission_prefetches_the_first_two_chunks() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, store, ledger) = test_pipeline().await;

        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one", "chunk two"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();

        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        // Chunk 2 is beyond the initial buffer depth.
        let status = pipeline.get_status("doc1", 2).await.unwrap();
        assert_eq!(status.status, "pending");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
        assert_eq!(store.put_count(), 2);

        // The ledger carries the back-filled URLs.
        assert_eq!(
            ledger.audio_url("doc1", 0).await.unwrap().as_deref(),
            Some("memory://audio/doc1_chunk_0.mp3")
        );
    }

    #[tokio::test]
    async fn ready_status_reports_neighbor_readiness() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, _store, _ledger) = test_pipeline().await;

        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one", "chunk two"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        let status = pipeline.get_status("doc1", 0).await.unwrap();
        assert_eq!(status.url.as_deref(), Some("memory://audio/doc1_chunk_0.mp3"));
        assert_eq!(status.has_next, Some(true));
        assert_eq!(status.next_ready, Some(true));
    }

    #[tokio::test]
    async fn validation_failures_schedule_nothing() {
        let (pipeline, store, _ledger) = test_pipeline().await;

        let err = pipeline
            .process_document(
                "doc1",
                chunks(&["text"]),
                ProviderSettings::new("does-not-exist"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownProvider(_)));

        let err = pipeline
            .process_document("doc1", chunks(&["text"]), ProviderSettings::new("elevenlabs"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredentials(_)));

        let err = pipeline
            .process_document("doc1", Vec::new(), ProviderSettings::new("local-fallback"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyDocument));

        assert!(matches!(
            pipeline.get_status("doc1", 0).await.unwrap_err(),
            PipelineError::UnknownDocument(_)
        ));
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn out_of_range_index_is_a_validation_error() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&server))
            .await
            .unwrap();

        match pipeline.get_status("doc1", 5).await.unwrap_err() {
            PipelineError::OutOfRange { index, total } => {
                assert_eq!(index, 5);
                assert_eq!(total, 1);
            }
            other => panic!("expected OutOfRange, got {other}"),
        }
        assert!(matches!(
            pipeline.advance_from("doc1", 5, false).await.unwrap_err(),
            PipelineError::OutOfRange { .. }
        ));
    }

    // Scenario: the provider answers 429 for chunk 2 only. Chunk 2 records
    // the status and body; its neighbors are unaffected.
    #[tokio::test]
    async fn provider_429_fails_only_the_affected_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "text": "chunk two" })))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;
        mount_ok(&server).await;

        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one", "chunk two", "chunk three"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        // Reach chunk 2 the way a playback client would.
        pipeline.advance_from("doc1", 1, false).await.unwrap();
        wait_for_status(&pipeline, "doc1", 2, "error").await;

        let failed = pipeline.get_status("doc1", 2).await.unwrap();
        let reason = failed.error.unwrap();
        assert!(reason.contains("429"), "missing status in: {reason}");
        assert!(reason.contains("rate limited"), "missing body in: {reason}");

        assert_eq!(pipeline.get_status("doc1", 0).await.unwrap().status, "ready");
        assert!(pipeline.get_status("doc1", 0).await.unwrap().error.is_none());
        assert_eq!(pipeline.get_status("doc1", 3).await.unwrap().status, "pending");
        assert!(pipeline.get_status("doc1", 3).await.unwrap().error.is_none());

        let doc = pipeline.document_status("doc1").await.unwrap();
        assert_eq!(doc.total_chunks, 4);
        assert_eq!(doc.ready_chunks, 2);
        assert!(doc.has_more);
        assert!(doc.last_error.unwrap().contains("429"));
    }

    #[tokio::test]
    async fn aggregate_status_tracks_completion() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        let doc = pipeline.document_status("doc1").await.unwrap();
        assert_eq!(doc.total_chunks, 2);
        assert_eq!(doc.ready_chunks, 2);
        assert!(!doc.has_more);
        assert!(doc.last_error.is_none());
    }

    // Scenario: re-submitting the same document id reuses stored audio; no
    // provider is called the second time around.
    #[tokio::test]
    async fn resubmission_reuses_stored_audio_without_provider_calls() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, store, _ledger) = test_pipeline().await;
        let settings = elevenlabs_settings(&server);

        pipeline
            .process_document("doc1", chunks(&["chunk zero", "chunk one"]), settings.clone())
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;
        let first_run_requests = server.received_requests().await.unwrap().len();
        assert_eq!(first_run_requests, 2);
        assert_eq!(store.put_count(), 2);

        pipeline
            .process_document("doc1", chunks(&["chunk zero", "chunk one"]), settings)
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        assert_eq!(
            server.received_requests().await.unwrap().len(),
            first_run_requests,
            "resubmission must not call the provider"
        );
        assert_eq!(store.put_count(), 2, "resubmission must not re-upload");
    }

    // Scenario: repeated advance calls schedule the next chunk at most once.
    #[tokio::test]
    async fn repeated_advance_schedules_next_chunk_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/text-to-speech/.+/stream$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"mp3".to_vec())
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one", "chunk two"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();

        for _ in 0..10 {
            pipeline.advance_from("doc1", 0, false).await.unwrap();
        }
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        let requests = server.received_requests().await.unwrap();
        let chunk_one_requests = requests
            .iter()
            .filter(|r| String::from_utf8_lossy(&r.body).contains("chunk one"))
            .count();
        assert_eq!(chunk_one_requests, 1);
    }

    // N concurrent triggers for the same chunk: one provider invocation and
    // one blob-store write.
    #[tokio::test]
    async fn concurrent_generation_is_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/text-to-speech/.+/stream$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"mp3".to_vec())
                    .set_delay(Duration::from_millis(150)),
            )
            .mount(&server)
            .await;

        let (pipeline, store, _ledger) = test_pipeline().await;
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&server))
            .await
            .unwrap();

        let triggers: Vec<_> = (0..16)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.advance_from("doc1", 0, false).await })
            })
            .collect();
        for trigger in triggers {
            trigger.await.unwrap().unwrap();
        }
        wait_for_status(&pipeline, "doc1", 0, "ready").await;

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn midpoint_advance_extends_the_buffer_by_one() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document(
                "doc1",
                chunks(&["chunk zero", "chunk one", "chunk two", "chunk three"]),
                elevenlabs_settings(&server),
            )
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        wait_for_status(&pipeline, "doc1", 1, "ready").await;

        // Start of chunk 0: nothing beyond index 1 yet.
        pipeline.advance_from("doc1", 0, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.get_status("doc1", 2).await.unwrap().status, "pending");

        // Past the midpoint of chunk 0: chunk 2 joins the buffer.
        pipeline.advance_from("doc1", 0, true).await.unwrap();
        wait_for_status(&pipeline, "doc1", 2, "ready").await;
        assert_eq!(pipeline.get_status("doc1", 3).await.unwrap().status, "pending");
    }

    // A task that outlives its session (replaced by a newer submission)
    // discards its result instead of writing into the new session's state.
    #[tokio::test]
    async fn superseded_session_tasks_discard_their_results() {
        let slow_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"stale".to_vec())
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&slow_server)
            .await;
        let failing_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
            .mount(&failing_server)
            .await;

        let (pipeline, store, ledger) = test_pipeline().await;
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&slow_server))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Supersede while the slow task is still in flight.
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&failing_server))
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "error").await;

        // Give the stale task time to finish and (wrongly) publish.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = pipeline.get_status("doc1", 0).await.unwrap();
        assert_eq!(status.status, "error", "stale result leaked into new session");
        assert_eq!(store.put_count(), 0);
        assert_eq!(ledger.audio_url("doc1", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_chunk_is_retried_by_an_explicit_advance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .expect(1)
            .mount(&server)
            .await;

        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&server))
            .await
            .unwrap();
        wait_for_status(&pipeline, "doc1", 0, "error").await;

        // Swap the mock for a healthy one and re-trigger explicitly.
        server.reset().await;
        mount_ok(&server).await;
        pipeline.advance_from("doc1", 0, false).await.unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
    }

    // A busy rejection from the rate-limited provider means the request was
    // never attempted: the chunk goes back to pending, not failed, and an
    // explicit advance retries it.
    #[tokio::test]
    async fn busy_provider_leaves_the_chunk_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tts/bytes"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"audio".to_vec())
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;

        let (pipeline, _store, _ledger) = test_pipeline().await;
        let mut settings = ProviderSettings::new("cartesia");
        settings.api_key = Some("test-key".to_string());
        settings.base_url = Some(server.uri());

        // Occupy the process-wide pacer with a direct call so the pipeline's
        // generation task gets rejected.
        let warmup = {
            let provider = CartesiaProvider::from_settings(&settings).unwrap();
            tokio::spawn(async move {
                provider
                    .generate_audio("warmup", &SynthesisOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pipeline
            .process_document("doc1", chunks(&["only chunk"]), settings)
            .await
            .unwrap();
        warmup.await.unwrap().unwrap();

        // The rejected call never reached the backend.
        let status = pipeline.get_status("doc1", 0).await.unwrap();
        assert_eq!(status.status, "pending");
        assert!(status.error.is_none());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        pipeline.advance_from("doc1", 0, false).await.unwrap();
        wait_for_status(&pipeline, "doc1", 0, "ready").await;
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn evicted_document_is_unknown() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (pipeline, _store, _ledger) = test_pipeline().await;
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&server))
            .await
            .unwrap();

        assert!(pipeline.evict("doc1").await);
        assert!(!pipeline.evict("doc1").await);
        assert!(matches!(
            pipeline.get_status("doc1", 0).await.unwrap_err(),
            PipelineError::UnknownDocument(_)
        ));
    }

    #[tokio::test]
    async fn expired_sessions_are_evicted_lazily() {
        let server = MockServer::start().await;
        mount_ok(&server).await;
        let (store, ledger) = {
            let (p, s, l) = test_pipeline().await;
            drop(p);
            (s, l)
        };
        let config = PipelineConfig {
            retention_secs: 0,
            ..PipelineConfig::default()
        };
        let pipeline = ChunkPipeline::new(store, ledger, &config);
        pipeline
            .process_document("doc1", chunks(&["only chunk"]), elevenlabs_settings(&server))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            pipeline.get_status("doc1", 0).await.unwrap_err(),
            PipelineError::UnknownDocument(_)
        ));
    }

    #[tokio::test]
    async fn status_json_matches_the_wire_contract() {
        let response = StatusResponse::from_status(ChunkStatus::Ready {
            url: "http://cdn/a.mp3".to_string(),
            has_next: true,
            next_ready: false,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "ready",
                "url": "http://cdn/a.mp3",
                "hasNext": true,
                "nextReady": false,
            })
        );

        let pending = serde_json::to_value(StatusResponse::from_status(ChunkStatus::Pending)).unwrap();
        assert_eq!(pending, serde_json::json!({ "status": "pending" }));
    }
}
