use thiserror::Error;

/// Error taxonomy for the document-to-audio pipeline.
///
/// Validation failures (`UnknownProvider`, `MissingCredentials`,
/// `EmptyDocument`, `UnknownDocument`, `OutOfRange`) are raised before any
/// generation work starts. Provider and storage failures are recorded on the
/// affected chunk as `Failed(reason)` and surfaced through status queries.
/// `Busy` means the request was never attempted; the caller should retry
/// shortly instead of treating the chunk as failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported TTS provider: {0}")]
    UnknownProvider(String),

    #[error("missing credentials for TTS provider: {0}")]
    MissingCredentials(String),

    #[error("document contains no chunks")]
    EmptyDocument,

    #[error("no document session for id: {0}")]
    UnknownDocument(String),

    #[error("chunk index {index} out of range for document with {total} chunks")]
    OutOfRange { index: usize, total: usize },

    /// Non-2xx response from a synthesis backend.
    #[error("{provider} API error (HTTP {status}): {body}")]
    ProviderStatus {
        provider: String,
        status: u16,
        body: String,
    },

    /// Network-level failure before any HTTP status was received.
    #[error("{provider} request failed: {message}")]
    ProviderRequest { provider: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// The rate-limited provider already has a call in flight. Transient.
    #[error("{0} is busy with another synthesis call")]
    Busy(String),
}

impl PipelineError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
