use super::{ProviderSettings, SynthesisOptions, TtsProvider, REQUEST_TIMEOUT};
use crate::config::resolve_api_key;
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.together.xyz/v1";
const DEFAULT_MODEL: &str = "cartesia/sonic";
const DEFAULT_VOICE: &str = "laidback woman";

#[derive(Serialize)]
struct SynthRequest<'a> {
    model: String,
    input: &'a str,
    voice: String,
    response_format: &'static str,
}

/// Together.ai speech endpoint (OpenAI-compatible request shape).
pub struct TogetherProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl TogetherProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, PipelineError> {
        let api_key = resolve_api_key(settings.api_key.as_deref(), "TOGETHER_API_KEY")
            .ok_or_else(|| PipelineError::MissingCredentials("together".to_string()))?;
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
impl TtsProvider for TogetherProvider {
    fn id(&self) -> &'static str {
        "together"
    }

    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/audio/speech", self.base_url);
        debug!(
            document = options.filename.as_deref(),
            chunk = options.chunk_index,
            "requesting together synthesis"
        );
        let body = SynthRequest {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            input: text,
            voice: options.voice.clone().unwrap_or_else(|| self.voice.clone()),
            response_format: "mp3",
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "together".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderStatus {
                provider: "together".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "together".to_string(),
                message: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}
