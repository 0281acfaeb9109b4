pub mod config;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod provider;
pub mod segmenter;
pub mod session;
pub mod storage;

pub use config::{load_config, PipelineConfig};
pub use error::PipelineError;
pub use ledger::{Ledger, SqliteLedger};
pub use pipeline::{ChunkPipeline, DocumentStatus, StatusResponse};
pub use provider::{build_provider, ProviderSettings, SynthesisOptions, TtsProvider};
pub use segmenter::{segment, Chunk, DEFAULT_MAX_WORDS_PER_CHUNK};
pub use session::{ChunkState, ChunkStatus, DocumentSession};
pub use storage::{audio_key, BlobStore, FsBlobStore, MemoryBlobStore};
