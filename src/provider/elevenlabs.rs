use super::{ProviderSettings, SynthesisOptions, TtsProvider, REQUEST_TIMEOUT};
use crate::config::resolve_api_key;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const DEFAULT_MODEL: &str = "eleven_flash_v2_5";
const DEFAULT_VOICE: &str = "cgSgspJ2msm6clMCkdW9";

#[derive(Serialize)]
struct SynthRequest<'a> {
    text: &'a str,
    model_id: String,
}

/// ElevenLabs streaming text-to-speech endpoint.
pub struct ElevenLabsProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl ElevenLabsProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, PipelineError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), "ELEVENLABS_API_KEY")
            .ok_or_else(|| PipelineError::MissingCredentials("elevenlabs".to_string()))?;
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
        })
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsProvider {
    fn id(&self) -> &'static str {
        "elevenlabs"
    }

    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        let voice = options.voice.clone().unwrap_or_else(|| self.voice.clone());
        let model = options.model.clone().unwrap_or_else(|| self.model.clone());
        let url = format!("{}/text-to-speech/{}/stream", self.base_url, voice);
        debug!(
            document = options.filename.as_deref(),
            chunk = options.chunk_index,
            %voice,
            "requesting elevenlabs synthesis"
        );

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", "mp3_44100_128")])
            .header("xi-api-key", &self.api_key)
            .json(&SynthRequest {
                text,
                model_id: model,
            })
            .send()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "elevenlabs".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderStatus {
                provider: "elevenlabs".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "elevenlabs".to_string(),
                message: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}
