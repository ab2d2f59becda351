use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::backoff::ErrorClass;
use crate::budget::BudgetState;
use crate::cli::Variant;
use crate::error::PipelineError;
use crate::util::{now_utc_string, sha256_hex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub prompt_payload: String,
    pub expected_answer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Baseline,
    Thesis,
    Antithesis,
    Synthesis,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Thesis => "thesis",
            Self::Antithesis => "antithesis",
            Self::Synthesis => "synthesis",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "baseline" => Some(Self::Baseline),
            "thesis" => Some(Self::Thesis),
            "antithesis" => Some(Self::Antithesis),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }

    pub fn chain_for(variant: Variant) -> &'static [StageName] {
        match variant {
            Variant::Baseline => &[StageName::Baseline],
            Variant::Dialectical => &[StageName::Thesis, StageName::Antithesis, StageName::Synthesis],
        }
    }
}

/// Output of one successful external call. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub item_id: String,
    pub pipeline_run_id: String,
    pub stage_index: usize,
    pub stage_name: StageName,
    pub input_text: String,
    pub output_text: String,
    pub temperature: f64,
    pub token_usage: TokenUsage,
    pub cost: f64,
    pub prompt_hash: String,
    pub response_hash: String,
    pub timestamp: String,
    pub attempt_count: u32,
}

pub struct StageResultDraft<'a> {
    pub item_id: &'a str,
    pub pipeline_run_id: &'a str,
    pub stage_index: usize,
    pub stage_name: StageName,
    pub temperature: f64,
    pub attempt_count: u32,
    pub cost: f64,
}

impl StageResult {
    pub fn from_call(
        draft: StageResultDraft<'_>,
        input_text: String,
        output_text: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        Self {
            item_id: draft.item_id.to_string(),
            pipeline_run_id: draft.pipeline_run_id.to_string(),
            stage_index: draft.stage_index,
            stage_name: draft.stage_name,
            prompt_hash: sha256_hex(&input_text),
            response_hash: sha256_hex(&output_text),
            input_text,
            output_text,
            temperature: draft.temperature,
            token_usage: TokenUsage::new(prompt_tokens, completion_tokens),
            cost: draft.cost,
            timestamp: now_utc_string(),
            attempt_count: draft.attempt_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Sampling parameters of one pipeline instance. A plain (non-voting) run is
/// instance 0 with the stage temperatures from config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceParams {
    pub instance_index: u32,
    pub seed: u64,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageName,
    pub class: Option<ErrorClass>,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_run_id: String,
    pub item_id: String,
    pub instance: InstanceParams,
    pub stages: Vec<StageResult>,
    pub final_answer: Option<String>,
    pub status: RunStatus,
    pub failure: Option<StageFailure>,
}

impl PipelineRun {
    pub fn new(run_id: &str, item_id: &str, instance: InstanceParams) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline_run_id: format!("{run_id}:{item_id}:{}", instance.instance_index),
            item_id: item_id.to_string(),
            instance,
            stages: Vec::new(),
            final_answer: None,
            status: RunStatus::Pending,
            failure: None,
        }
    }

    /// Appends a stage result, keeping the chain order-preserving and
    /// stage-name-unique.
    pub fn push_stage(&mut self, result: StageResult) -> Result<(), PipelineError> {
        if result.stage_index != self.stages.len() {
            return Err(PipelineError::InvalidStageOrder {
                pipeline_run_id: self.pipeline_run_id.clone(),
                expected: self.stages.len(),
                actual: result.stage_index,
            });
        }
        if self.stages.iter().any(|stage| stage.stage_name == result.stage_name) {
            return Err(PipelineError::DuplicateStage {
                pipeline_run_id: self.pipeline_run_id.clone(),
                stage: result.stage_name.as_str().to_string(),
            });
        }
        self.stages.push(result);
        Ok(())
    }

    pub fn total_usage(&self) -> TokenUsage {
        let mut usage = TokenUsage::default();
        for stage in &self.stages {
            usage += stage.token_usage;
        }
        usage
    }

    pub fn total_cost(&self) -> f64 {
        self.stages.iter().map(|stage| stage.cost).sum()
    }

    pub fn last_output(&self) -> Option<&str> {
        self.stages.last().map(|stage| stage.output_text.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Single,
    Unanimous,
    Majority,
    Plurality,
    TieBreakDefaultTemperature,
    NoValidAnswers,
}

impl VoteDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Unanimous => "unanimous",
            Self::Majority => "majority",
            Self::Plurality => "plurality",
            Self::TieBreakDefaultTemperature => "tie_break_default_temperature",
            Self::NoValidAnswers => "no_valid_answers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceVote {
    pub instance_index: u32,
    pub instance_seed: u64,
    pub instance_temperature: f64,
    pub final_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteBundle {
    pub item_id: String,
    pub instance_results: Vec<InstanceVote>,
    pub consensus_answer: Option<String>,
    pub vote_counts: BTreeMap<String, usize>,
    pub decision: VoteDecision,
}

/// Per-item verdict persisted for the comparator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub run_id: String,
    pub item_id: String,
    pub expected_answer: String,
    pub predicted_answer: Option<String>,
    pub is_correct: bool,
    pub status: RunStatus,
    pub decision: VoteDecision,
    pub vote_counts: BTreeMap<String, usize>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub item_id: String,
    pub stage: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub variant: Variant,
    pub dataset: String,
    pub model_id: String,
    pub mamv_enabled: bool,
    pub n_items: usize,
    pub processed_items: usize,
    pub skipped_completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost: f64,
    pub errors: usize,
    pub error_details: Vec<ItemError>,
    pub budget: BudgetState,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub generated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(run: &PipelineRun, index: usize, name: StageName, prompt: u64, completion: u64) -> StageResult {
        StageResult::from_call(
            StageResultDraft {
                item_id: &run.item_id,
                pipeline_run_id: &run.pipeline_run_id,
                stage_index: index,
                stage_name: name,
                temperature: 0.7,
                attempt_count: 1,
                cost: 0.01,
            },
            format!("prompt {index}"),
            format!("output {index}"),
            prompt,
            completion,
        )
    }

    fn instance() -> InstanceParams {
        InstanceParams {
            instance_index: 0,
            seed: 42,
            temperature: None,
        }
    }

    #[test]
    fn stage_result_total_is_prompt_plus_completion() {
        let run = PipelineRun::new("run-1", "gsm8k-0001", instance());
        let result = stage(&run, 0, StageName::Thesis, 120, 80);
        assert_eq!(result.token_usage.total, 200);
        assert_eq!(result.prompt_hash, sha256_hex("prompt 0"));
        assert_eq!(result.response_hash, sha256_hex("output 0"));
    }

    #[test]
    fn pipeline_run_rejects_out_of_order_and_duplicate_stages() {
        let mut run = PipelineRun::new("run-1", "gsm8k-0001", instance());
        let first = stage(&run, 0, StageName::Thesis, 10, 10);
        let skipped = stage(&run, 2, StageName::Synthesis, 10, 10);
        let duplicate = stage(&run, 1, StageName::Thesis, 10, 10);

        run.push_stage(first).expect("first stage accepted");
        assert!(matches!(
            run.push_stage(skipped),
            Err(PipelineError::InvalidStageOrder { expected: 1, actual: 2, .. })
        ));
        assert!(matches!(
            run.push_stage(duplicate),
            Err(PipelineError::DuplicateStage { .. })
        ));
        assert_eq!(run.stages.len(), 1);
    }

    #[test]
    fn pipeline_run_totals_sum_stage_usage() {
        let mut run = PipelineRun::new("run-1", "gsm8k-0001", instance());
        for (index, name) in StageName::chain_for(Variant::Dialectical).iter().enumerate() {
            let result = stage(&run, index, *name, 100, 50);
            run.push_stage(result).expect("stage accepted");
        }
        let usage = run.total_usage();
        assert_eq!(usage, TokenUsage::new(300, 150));
        assert!((run.total_cost() - 0.03).abs() < 1e-12);
        assert_eq!(run.last_output(), Some("output 2"));
    }

    #[test]
    fn stage_names_round_trip_through_strings() {
        for name in [
            StageName::Baseline,
            StageName::Thesis,
            StageName::Antithesis,
            StageName::Synthesis,
        ] {
            assert_eq!(StageName::parse(name.as_str()), Some(name));
        }
        assert_eq!(StageName::parse("critique"), None);
    }
}
