use super::{ProviderSettings, SynthesisOptions, TtsProvider};
use crate::error::PipelineError;
use async_trait::async_trait;
use aws_sdk_polly::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_polly::error::DisplayErrorContext;
use aws_sdk_polly::types::{Engine, OutputFormat, VoiceId};
use tracing::debug;

const DEFAULT_VOICE: &str = "Joanna";
const DEFAULT_REGION: &str = "us-east-1";

/// Amazon Polly. Credentials come from the standard AWS environment
/// variables; the `model` knob selects the engine (`neural` by default).
pub struct PollyProvider {
    client: aws_sdk_polly::Client,
    engine: String,
    voice: String,
}

impl PollyProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, PipelineError> {
        let access_key = non_empty_env("AWS_ACCESS_KEY_ID");
        let secret_key = non_empty_env("AWS_SECRET_ACCESS_KEY");
        let (access_key, secret_key) = match (access_key, secret_key) {
            (Some(a), Some(s)) => (a, s),
            _ => return Err(PipelineError::MissingCredentials("polly".to_string())),
        };
        let region = non_empty_env("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());

        let config = aws_sdk_polly::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "openreader-tts"))
            .build();

        Ok(Self {
            client: aws_sdk_polly::Client::from_conf(config),
            engine: settings
                .model
                .clone()
                .unwrap_or_else(|| "neural".to_string()),
            voice: settings
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[async_trait]
impl TtsProvider for PollyProvider {
    fn id(&self) -> &'static str {
        "polly"
    }

    async fn generate_audio(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>, PipelineError> {
        let voice = options.voice.clone().unwrap_or_else(|| self.voice.clone());
        let engine = options.model.clone().unwrap_or_else(|| self.engine.clone());
        let engine = match engine.as_str() {
            "standard" => Engine::Standard,
            _ => Engine::Neural,
        };
        debug!(
            document = options.filename.as_deref(),
            chunk = options.chunk_index,
            %voice,
            "requesting polly synthesis"
        );

        let output = self
            .client
            .synthesize_speech()
            .output_format(OutputFormat::Mp3)
            .text(text)
            .voice_id(VoiceId::from(voice.as_str()))
            .engine(engine)
            .send()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "polly".to_string(),
                message: format!("{}", DisplayErrorContext(&e)),
            })?;

        let audio = output
            .audio_stream
            .collect()
            .await
            .map_err(|e| PipelineError::ProviderRequest {
                provider: "polly".to_string(),
                message: e.to_string(),
            })?;
        Ok(audio.into_bytes().to_vec())
    }
}
