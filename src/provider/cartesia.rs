use super::{ProviderSettings, SynthesisOptions, TtsProvider, REQUEST_TIMEOUT};
use crate::config::resolve_api_key;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.cartesia.ai";
const DEFAULT_MODEL: &str = "sonic-english";
const DEFAULT_VOICE: &str = "a0e99841-438c-4a64-b679-ae501e7d6091";
const API_VERSION: &str = "2025-04-16";

/// Minimum spacing between calls, process-wide. Cartesia quotas apply per
/// API key, not per document.
const MIN_CALL_GAP: Duration = Duration::from_millis(500);

/// Provider-level single-flight gate with minimum inter-call spacing.
///
/// `pace` rejects immediately with [`PipelineError::Busy`] when another call
/// already holds the slot, then waits out the remaining gap before running
/// the call. The lock is held across the call on purpose: that is the
/// single-flight guarantee.
pub(crate) struct CallPacer {
    min_gap: Duration,
    next_slot: Mutex<Instant>,
}

impl CallPacer {
    pub(crate) fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub(crate) async fn pace<T>(
        &self,
        provider: &str,
        call: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        let mut slot = self
            .next_slot
            .try_lock()
            .map_err(|_| PipelineError::Busy(provider.to_string()))?;
        tokio::time::sleep_until(*slot).await;
        let result = call.await;
        *slot = Instant::now() + self.min_gap;
        result
    }
}

fn shared_pacer() -> &'static CallPacer {
    static PACER: OnceLock<CallPacer> = OnceLock::new();
    PACER.get_or_init(|| CallPacer::new(MIN_CALL_GAP))
}

#[derive(Serialize)]
struct SynthRequest<'a> {
    model_id: String,
    transcript: &'a str,
    voice: VoiceRef,
    output_format: OutputFormat,
    language: &'static str,
}

#[derive(Serialize)]
struct VoiceRef {
    mode: &'static str,
    id: String,
}

#[derive(Serialize)]
struct OutputFormat {
    container: &'static str,
    bit_rate: u32,
    sample_rate: u32,
}

/// Cartesia bytes endpoint. Low-throughput: all calls from this process
/// share one pacer regardless of which document they serve.
pub struct CartesiaProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
    pacer: &'static CallPacer,
}

impl CartesiaProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, PipelineError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), "CARTESIA_API_KEY")
            .ok_or_else(|| PipelineError::MissingCredentials("cartesia".to_string()))?;
        Ok(Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: settings
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            pacer: shared_pacer(),
        })
    }

    async fn call_api(&self, text: &str, options: &SynthesisOptions) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/tts/bytes", self.base_url);
        debug!(
            document = options.filename.as_deref(),
            chunk = options.chunk_index,
            "requesting cartesia synthesis"
        );
        let body = SynthRequest {
            model_id: options.model.clone().unwrap_or_else(|| self.model.clone()),
            transcript: text,
            voice: VoiceRef {
                mode: "id",
                id: options.voice.clone().unwrap_or_else(|| self.voice.clone()),
            },
            output_format: OutputFormat {
                container: "mp3",
                bit_rate: 128_000,
                sample_rate: 44_100,
            },
            language: "en",
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Cartesia-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "cartesia".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderStatus {
                provider: "cartesia".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "cartesia".to_string(),
                message: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl TtsProvider for CartesiaProvider {
    fn id(&self) -> &'static str {
        "cartesia"
    }

    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        self.pacer
            .pace("cartesia", self.call_api(text, options))
            .await
    }
}
