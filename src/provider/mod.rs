//! Speech-synthesis providers.
//!
//! Every backend implements [`TtsProvider`] and is selected through
//! [`build_provider`], which rejects unknown identifiers and fails fast on
//! missing credentials. There is no implicit fallback: a caller who wants the
//! no-credential demo path must ask for `"local-fallback"` by name.

pub mod cartesia;
pub mod elevenlabs;
pub mod local;
pub mod polly;
pub mod together;

pub use cartesia::CartesiaProvider;
pub use elevenlabs::ElevenLabsProvider;
pub use local::LocalFallbackProvider;
pub use polly::PollyProvider;
pub use together::TogetherProvider;

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call knobs. `model` and `voice` override the provider's defaults;
/// `filename` and `chunk_index` identify the document chunk in provider
/// logs (output naming itself is the blob store's job).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub filename: Option<String>,
    pub chunk_index: Option<usize>,
}

/// Provider selection and credentials for one document session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// One of `"elevenlabs"`, `"cartesia"`, `"together"`, `"polly"`,
    /// `"local-fallback"`.
    pub provider: String,
    /// Explicit API key. Falls back to the provider's environment variable
    /// (e.g. `ELEVENLABS_API_KEY`) when absent.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    /// Override the provider's API base URL (tests, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderSettings {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: None,
            model: None,
            voice: None,
            base_url: None,
        }
    }
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Stable identifier, matching the factory's selection string.
    fn id(&self) -> &'static str;

    /// Synthesize text to audio bytes (MP3).
    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError>;
}

/// Build a provider from settings. Unknown identifiers and missing
/// credentials are validation errors; nothing is scheduled for a document
/// whose provider cannot be built.
pub fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn TtsProvider>, PipelineError> {
    match settings.provider.as_str() {
        "elevenlabs" => Ok(Arc::new(ElevenLabsProvider::from_settings(settings)?)),
        "cartesia" => Ok(Arc::new(CartesiaProvider::from_settings(settings)?)),
        "together" => Ok(Arc::new(TogetherProvider::from_settings(settings)?)),
        "polly" => Ok(Arc::new(PollyProvider::from_settings(settings)?)),
        "local-fallback" => Ok(Arc::new(LocalFallbackProvider::from_settings(settings))),
        other => Err(PipelineError::UnknownProvider(other.to_string())),
    }
}
