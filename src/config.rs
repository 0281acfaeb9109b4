//! Pipeline configuration: JSON file loading with serde defaults and
//! API key resolution from an explicit field or the environment.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on words per chunk handed to a provider.
    #[serde(default = "default_max_words")]
    pub max_words_per_chunk: usize,
    /// How long an inactive document session stays reachable. Expiry is
    /// checked lazily on read, so an active document is never evicted
    /// underneath its own tasks.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Root directory for the filesystem blob store.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,
    /// Public base URL under which stored audio is served.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_words_per_chunk: default_max_words(),
            retention_secs: default_retention_secs(),
            audio_dir: default_audio_dir(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_max_words() -> usize {
    crate::segmenter::DEFAULT_MAX_WORDS_PER_CHUNK
}
fn default_retention_secs() -> u64 {
    86_400
}
fn default_audio_dir() -> String {
    "uploads".to_string()
}
fn default_public_base_url() -> String {
    "http://localhost:8080/uploads".to_string()
}

/// Load a pipeline config from a JSON file, falling back to defaults if the
/// file is missing or unparsable.
pub fn load_config(path: &Path) -> PipelineConfig {
    load_json_config(path, "pipeline")
}

/// Generic load for any Serde config type with a `Default` implementation.
pub(crate) fn load_json_config<T: DeserializeOwned + Default>(path: &Path, label: &str) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(config) => {
                tracing::info!(config = %path.display(), "loaded {} config", label);
                config
            }
            Err(e) => {
                tracing::warn!(
                    config = %path.display(),
                    error = %e,
                    "failed to parse {} config, using defaults",
                    label
                );
                T::default()
            }
        },
        Err(_) => {
            tracing::info!(
                config = %path.display(),
                "no {} config file, using defaults",
                label
            );
            T::default()
        }
    }
}

/// Resolve an API key: prefer the explicitly supplied key, then fall back to
/// the provider's environment variable. Empty strings count as absent.
pub(crate) fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Option<String> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Some(key),
        _ => None,
    }
}
