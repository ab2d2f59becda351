use thiserror::Error;

use crate::backoff::ErrorClass;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("rate limited by text-generation service: {0}")]
    RateLimited(String),

    #[error("transient text-generation service error: {0}")]
    TransientService(String),

    #[error("stage {stage} failed after {attempts} attempt(s) ({class:?}): {message}")]
    StageFailed {
        stage: String,
        attempts: u32,
        class: ErrorClass,
        message: String,
    },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("sanitization violation, shared write blocked: {0}")]
    SanitizationViolation(String),

    #[error("data mismatch: {0}")]
    DataMismatch(String),

    #[error("no consensus for item {item_id}")]
    NoConsensus { item_id: String },

    #[error("run halted: {0}")]
    Halted(String),

    #[error("stage order violated in {pipeline_run_id}: expected index {expected}, got {actual}")]
    InvalidStageOrder {
        pipeline_run_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("stage {stage} already recorded in {pipeline_run_id}")]
    DuplicateStage {
        pipeline_run_id: String,
        stage: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
