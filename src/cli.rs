use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(
    name = "dialectic-eval",
    version,
    about = "Resumable, budget-governed evaluation of dialectical LLM pipelines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Run(RunArgs),
    Compare(CompareArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Dialectical,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Dialectical => "dialectical",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCapMode {
    Advisory,
    HardStop,
}

impl ItemCapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advisory => "advisory",
            Self::HardStop => "hard_stop",
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[arg(long, default_value = ".cache/dialectic")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Reuse an existing run id to resume it.
    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long)]
    pub dataset: Option<String>,

    #[arg(long)]
    pub dataset_path: Option<PathBuf>,

    #[arg(long)]
    pub n_items: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, value_enum)]
    pub variant: Option<Variant>,

    #[arg(long)]
    pub model_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub mamv: bool,

    #[arg(long)]
    pub mamv_instances: Option<u32>,

    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub run_budget_cap: Option<f64>,

    #[arg(long)]
    pub item_token_cap: Option<u64>,

    #[arg(long, value_enum)]
    pub item_cap_mode: Option<ItemCapMode>,

    #[arg(long, default_value_t = false)]
    pub budget_hard_stop: bool,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Run id whose persisted totals serve as the cost baseline.
    #[arg(long)]
    pub baseline_run: Option<String>,

    #[arg(long)]
    pub summary_path: Option<PathBuf>,

    /// Use the offline generator instead of the remote service.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[arg(long, default_value = ".cache/dialectic")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub run_a: String,

    #[arg(long)]
    pub run_b: String,

    #[arg(long)]
    pub output_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/dialectic")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,
}
