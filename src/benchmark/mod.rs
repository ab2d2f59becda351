use crate::error::PipelineError;
use crate::model::WorkItem;
use crate::util::sha256_lines;

mod jsonl;
pub(crate) mod normalize;

pub use jsonl::{AnswerMode, JsonlBenchmark};

/// Source of work items plus the dataset's answer rules.
pub trait BenchmarkLoader: Send + Sync {
    fn dataset(&self) -> &str;

    /// Deterministic for a given `(n, seed)` and source file.
    fn load(&self, n: usize, seed: u64) -> Result<Vec<WorkItem>, PipelineError>;

    fn normalize(&self, raw_answer: &str) -> Option<String>;

    fn is_correct(&self, expected: &str, predicted: &str) -> bool;
}

/// SHA-256 over the ordered item ids of a sample.
pub fn sample_fingerprint(items: &[WorkItem]) -> String {
    sha256_lines(items.iter().map(|item| item.id.as_str()))
}
