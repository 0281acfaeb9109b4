use super::{ProviderSettings, SynthesisOptions, TtsProvider, REQUEST_TIMEOUT};
use crate::error::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://translate.google.com";
const DEFAULT_LANGUAGE: &str = "en";

/// No-credential demo provider backed by the unauthenticated Google
/// Translate TTS endpoint. It must be requested explicitly by the
/// `"local-fallback"` identifier; it is never substituted for a provider
/// whose credentials are missing.
pub struct LocalFallbackProvider {
    client: Client,
    base_url: String,
    language: String,
}

impl LocalFallbackProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            // The voice knob doubles as the language code here.
            language: settings
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        }
    }
}

#[async_trait]
impl TtsProvider for LocalFallbackProvider {
    fn id(&self) -> &'static str {
        "local-fallback"
    }

    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        let language = options
            .voice
            .clone()
            .unwrap_or_else(|| self.language.clone());
        let url = format!("{}/translate_tts", self.base_url);
        debug!(
            document = options.filename.as_deref(),
            chunk = options.chunk_index,
            "requesting local-fallback synthesis"
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("ie", "UTF-8"),
                ("tl", language.as_str()),
                ("client", "tw-ob"),
                ("q", text),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "local-fallback".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderStatus {
                provider: "local-fallback".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "local-fallback".to_string(),
                message: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}
