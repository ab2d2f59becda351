use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use tracing::info;

use super::BenchmarkLoader;
use super::normalize::{NumericNormalizer, normalize_text, numeric_equal};
use crate::error::PipelineError;
use crate::model::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Numeric,
    Exact,
}

#[derive(Deserialize)]
struct SourceRecord {
    question: String,
    answer: String,
    #[serde(default)]
    id: Option<String>,
}

/// `{question, answer[, id]}` per line. Items without an explicit id are
/// named `<dataset>-<line index>` so ids survive re-sampling.
pub struct JsonlBenchmark {
    dataset: String,
    path: PathBuf,
    mode: AnswerMode,
    normalizer: NumericNormalizer,
}

impl JsonlBenchmark {
    pub fn open(dataset: &str, path: &Path, mode: AnswerMode) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("benchmark file not found: {}", path.display());
        }
        Ok(Self {
            dataset: dataset.to_string(),
            path: path.to_path_buf(),
            mode,
            normalizer: NumericNormalizer::new()?,
        })
    }

    /// Numeric rules unless the dataset name says otherwise.
    pub fn mode_for_dataset(dataset: &str) -> AnswerMode {
        match dataset.to_ascii_lowercase().as_str() {
            "strategyqa" | "boolq" | "hotpotqa" | "exact" => AnswerMode::Exact,
            _ => AnswerMode::Numeric,
        }
    }

    fn read_all(&self) -> Result<Vec<WorkItem>, PipelineError> {
        let raw = fs::read_to_string(&self.path)?;
        let mut items = Vec::new();

        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SourceRecord = serde_json::from_str(line).map_err(|e| {
                PipelineError::FatalConfig(format!(
                    "{}:{}: invalid benchmark record: {e}",
                    self.path.display(),
                    index + 1
                ))
            })?;

            let expected_answer = self
                .normalize(&record.answer)
                .unwrap_or_else(|| record.answer.trim().to_string());
            items.push(WorkItem {
                id: record
                    .id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("{}-{index:04}", self.dataset)),
                prompt_payload: record.question,
                expected_answer,
            });
        }

        Ok(items)
    }
}

impl BenchmarkLoader for JsonlBenchmark {
    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn load(&self, n: usize, seed: u64) -> Result<Vec<WorkItem>, PipelineError> {
        let all = self.read_all()?;
        let total = all.len();
        if total == 0 {
            return Err(PipelineError::FatalConfig(format!(
                "benchmark file is empty: {}",
                self.path.display()
            )));
        }

        let mut indices = if n >= total {
            (0..total).collect::<Vec<_>>()
        } else {
            let mut rng = StdRng::seed_from_u64(seed);
            rand::seq::index::sample(&mut rng, total, n).into_vec()
        };
        indices.sort_unstable();

        let mut slots: Vec<Option<WorkItem>> = all.into_iter().map(Some).collect();
        let sample: Vec<WorkItem> = indices
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();

        info!(
            dataset = %self.dataset,
            available = total,
            sampled = sample.len(),
            seed,
            "benchmark sample loaded"
        );
        Ok(sample)
    }

    fn normalize(&self, raw_answer: &str) -> Option<String> {
        match self.mode {
            AnswerMode::Numeric => self.normalizer.extract(raw_answer),
            AnswerMode::Exact => normalize_text(raw_answer),
        }
    }

    fn is_correct(&self, expected: &str, predicted: &str) -> bool {
        match self.mode {
            AnswerMode::Numeric => numeric_equal(expected, predicted),
            AnswerMode::Exact => expected == predicted,
        }
    }
}
