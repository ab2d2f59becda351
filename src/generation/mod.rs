use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dry_run;
mod openai;

pub use dry_run::DryRunGenerator;
pub use openai::OpenAiCompatClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub model_id: String,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("http status {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    /// Bad or missing credentials; retrying or continuing the batch is pointless.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::Http { status: 401 | 403, .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Http { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Rough token count, about four characters per token. Used when the
/// service reports no usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// The external text-generation service. Implementations are stateless per
/// call; retries and backoff are owned by the caller.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError>;
}
