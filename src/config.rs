use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::budget::{
    BaselineReference, BudgetLimits, DEFAULT_ALERT_THRESHOLD_PCT, DEFAULT_COST_RATIO_TARGET,
    DEFAULT_ITEM_TOKEN_CAP,
};
use crate::cli::{ItemCapMode, RunArgs, Variant};
use crate::error::PipelineError;
use crate::model::{InstanceParams, StageName};
use crate::pricing::ModelPrice;
use crate::voting::DEFAULT_VOTE_TEMPERATURE;

const INSTANCE_SEED_STRIDE: u64 = 101;
const MAX_BACKOFF_SECS: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTemperatures {
    pub baseline: f64,
    pub thesis: f64,
    pub antithesis: f64,
    pub synthesis: f64,
}

impl Default for StageTemperatures {
    fn default() -> Self {
        Self {
            baseline: 0.7,
            thesis: 0.7,
            antithesis: 0.5,
            synthesis: 0.2,
        }
    }
}

impl StageTemperatures {
    pub fn for_stage(&self, stage: StageName) -> f64 {
        match stage {
            StageName::Baseline => self.baseline,
            StageName::Thesis => self.thesis,
            StageName::Antithesis => self.antithesis,
            StageName::Synthesis => self.synthesis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dataset: String,
    pub dataset_path: Option<PathBuf>,
    pub n_items: usize,
    pub seed: u64,
    pub variant: Variant,
    pub model_id: String,
    pub stage_temperatures: StageTemperatures,
    pub max_tokens_per_stage: u32,
    pub mamv_enabled: bool,
    pub mamv_instances: u32,
    pub mamv_temperatures: Vec<f64>,
    pub default_vote_temperature: f64,
    pub item_token_cap: u64,
    pub item_cap_mode: ItemCapMode,
    pub run_budget_cap: f64,
    pub budget_hard_stop: bool,
    pub alert_threshold_pct: f64,
    pub baseline_reference: Option<BaselineReference>,
    pub cost_ratio_target: Option<f64>,
    pub max_retries: u32,
    /// Seconds.
    pub backoff_base: f64,
    /// Seconds.
    pub backoff_cap: f64,
    pub request_timeout_secs: u64,
    pub workers: usize,
    pub pricing: BTreeMap<String, ModelPrice>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: "gsm8k".to_string(),
            dataset_path: None,
            n_items: 50,
            seed: 42,
            variant: Variant::Dialectical,
            model_id: "deepseek-chat".to_string(),
            stage_temperatures: StageTemperatures::default(),
            max_tokens_per_stage: 2000,
            mamv_enabled: false,
            mamv_instances: 3,
            mamv_temperatures: vec![0.65, 0.70, 0.75],
            default_vote_temperature: DEFAULT_VOTE_TEMPERATURE,
            item_token_cap: DEFAULT_ITEM_TOKEN_CAP,
            item_cap_mode: ItemCapMode::Advisory,
            run_budget_cap: 10.0,
            budget_hard_stop: false,
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
            baseline_reference: None,
            cost_ratio_target: Some(DEFAULT_COST_RATIO_TARGET),
            max_retries: 3,
            backoff_base: 1.0,
            backoff_cap: 60.0,
            request_timeout_secs: 120,
            workers: 4,
            pricing: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read run config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse run config: {}", path.display()))
    }

    pub fn apply_overrides(&mut self, args: &RunArgs) {
        if let Some(dataset) = &args.dataset {
            self.dataset = dataset.clone();
        }
        if let Some(path) = &args.dataset_path {
            self.dataset_path = Some(path.clone());
        }
        if let Some(n_items) = args.n_items {
            self.n_items = n_items;
        }
        if let Some(seed) = args.seed {
            self.seed = seed;
        }
        if let Some(variant) = args.variant {
            self.variant = variant;
        }
        if let Some(model_id) = &args.model_id {
            self.model_id = model_id.clone();
        }
        if args.mamv {
            self.mamv_enabled = true;
        }
        if let Some(instances) = args.mamv_instances {
            self.mamv_instances = instances;
        }
        if let Some(workers) = args.workers {
            self.workers = workers;
        }
        if let Some(cap) = args.run_budget_cap {
            self.run_budget_cap = cap;
        }
        if let Some(cap) = args.item_token_cap {
            self.item_token_cap = cap;
        }
        if let Some(mode) = args.item_cap_mode {
            self.item_cap_mode = mode;
        }
        if args.budget_hard_stop {
            self.budget_hard_stop = true;
        }
        if let Some(max_retries) = args.max_retries {
            self.max_retries = max_retries;
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |message: String| Err(PipelineError::FatalConfig(message));

        if self.dataset.trim().is_empty() {
            return invalid("dataset must not be empty".to_string());
        }
        if self.n_items == 0 {
            return invalid("n_items must be at least 1".to_string());
        }
        if self.model_id.trim().is_empty() {
            return invalid("model_id must not be empty".to_string());
        }
        for stage in [
            StageName::Baseline,
            StageName::Thesis,
            StageName::Antithesis,
            StageName::Synthesis,
        ] {
            let temperature = self.stage_temperatures.for_stage(stage);
            if !valid_temperature(temperature) {
                return invalid(format!(
                    "{} temperature {temperature} is outside [0, 2]",
                    stage.as_str()
                ));
            }
        }
        if self.max_tokens_per_stage == 0 {
            return invalid("max_tokens_per_stage must be positive".to_string());
        }
        if self.mamv_instances == 0 {
            return invalid("mamv_instances must be at least 1".to_string());
        }
        if self.mamv_temperatures.is_empty() {
            return invalid("mamv_temperatures must not be empty".to_string());
        }
        if let Some(bad) = self
            .mamv_temperatures
            .iter()
            .chain(std::iter::once(&self.default_vote_temperature))
            .find(|temperature| !valid_temperature(**temperature))
        {
            return invalid(format!("vote temperature {bad} is outside [0, 2]"));
        }
        if self.item_token_cap == 0 {
            return invalid("item_token_cap must be positive".to_string());
        }
        if !(self.run_budget_cap > 0.0) {
            return invalid("run_budget_cap must be positive".to_string());
        }
        if !(self.alert_threshold_pct > 0.0 && self.alert_threshold_pct <= 100.0) {
            return invalid("alert_threshold_pct must be in (0, 100]".to_string());
        }
        if self.cost_ratio_target.is_some_and(|target| !(target > 0.0)) {
            return invalid("cost_ratio_target must be positive".to_string());
        }
        if !(self.backoff_base >= 0.0) || !(self.backoff_cap >= 0.0) {
            return invalid("backoff_base and backoff_cap must be non-negative".to_string());
        }
        if self.backoff_cap > MAX_BACKOFF_SECS {
            return invalid(format!(
                "backoff_cap {} exceeds the {MAX_BACKOFF_SECS}s limit",
                self.backoff_cap
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return invalid(format!(
                "backoff_base {} exceeds backoff_cap {}",
                self.backoff_base, self.backoff_cap
            ));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn tasks_per_item(&self) -> u32 {
        if self.mamv_enabled { self.mamv_instances } else { 1 }
    }

    pub fn chain(&self) -> &'static [StageName] {
        StageName::chain_for(self.variant)
    }

    /// Instance 0 of a plain run keeps the configured stage temperatures.
    /// Voting instances cycle through `mamv_temperatures` and get seeds
    /// `seed + 101 * (index + 1)`.
    pub fn instances(&self) -> Vec<InstanceParams> {
        if !self.mamv_enabled {
            return vec![InstanceParams {
                instance_index: 0,
                seed: self.seed,
                temperature: None,
            }];
        }

        (0..self.mamv_instances)
            .map(|index| InstanceParams {
                instance_index: index,
                seed: self
                    .seed
                    .wrapping_add(INSTANCE_SEED_STRIDE * (u64::from(index) + 1)),
                temperature: Some(
                    self.mamv_temperatures[index as usize % self.mamv_temperatures.len()],
                ),
            })
            .collect()
    }

    /// Temperature of the stage at `stage_index` for one instance. A voting
    /// instance temperature replaces only the first stage's setting.
    pub fn stage_temperature(&self, instance: &InstanceParams, stage_index: usize, stage: StageName) -> f64 {
        match instance.temperature {
            Some(temperature) if stage_index == 0 => temperature,
            _ => self.stage_temperatures.for_stage(stage),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: backoff_duration(self.backoff_base),
            cap: backoff_duration(self.backoff_cap),
            jitter: true,
        }
    }

    pub fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            item_cap: self.item_token_cap,
            run_cap: self.run_budget_cap,
            alert_threshold_pct: self.alert_threshold_pct,
            cost_ratio_target: self.cost_ratio_target,
            baseline_reference: self.baseline_reference,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn valid_temperature(value: f64) -> bool {
    (0.0..=2.0).contains(&value)
}

/// Seconds to a duration bounded by `MAX_BACKOFF_SECS`; anything that is
/// not a non-negative number becomes zero.
fn backoff_duration(seconds: f64) -> Duration {
    if !(seconds > 0.0) {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(seconds.min(MAX_BACKOFF_SECS))
}
