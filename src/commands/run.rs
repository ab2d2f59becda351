use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::benchmark::{BenchmarkLoader, JsonlBenchmark, sample_fingerprint};
use crate::budget::{BaselineReference, BudgetGovernor};
use crate::cli::RunArgs;
use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::events::DualChannelLogger;
use crate::generation::{DryRunGenerator, OpenAiCompatClient, TextGenerator};
use crate::model::{RunSummary, TokenUsage, WorkItem};
use crate::pipeline::{
    BatchReport, BatchRunner, DefaultPrompts, HaltCause, HaltSignal, PipelineExecutor,
    STOP_FILENAME, build_summary,
};
use crate::pricing::PriceTable;
use crate::sanitize::Sanitizer;
use crate::store::{RunManifest, Store};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};
use crate::voting::MajorityVoteAggregator;

pub fn run(args: RunArgs) -> Result<()> {
    let summary = execute(&args)?;

    info!(
        run_id = %summary.run_id,
        variant = summary.variant.as_str(),
        n_items = summary.n_items,
        processed = summary.processed_items,
        skipped = summary.skipped_completed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        accuracy = %format!("{:.2}%", summary.accuracy * 100.0),
        total_tokens = summary.total_tokens,
        total_cost = %format!("${:.4}", summary.total_cost),
        errors = summary.errors,
        halted = summary.halted,
        "run finished"
    );

    Ok(())
}

/// Runs one session of an evaluation run and writes its summary. A second
/// call with the same run id resumes where the ledger left off.
pub fn execute(args: &RunArgs) -> Result<RunSummary> {
    let mut config = RunConfig::load(args.config.as_deref())?;
    config.apply_overrides(args);
    config.validate()?;

    let run_id = args.run_id.clone().unwrap_or_else(|| {
        format!(
            "{}-{}-{}",
            config.variant.as_str(),
            config.dataset,
            utc_compact_string(Utc::now())
        )
    });
    let run_dir = args.cache_root.join("runs").join(&run_id);
    ensure_directory(&run_dir)?;

    let store = Store::open(&args.cache_root)?;

    let Some(dataset_path) = config.dataset_path.clone() else {
        bail!(PipelineError::FatalConfig(
            "dataset_path is required (--dataset-path or config)".to_string()
        ));
    };
    let benchmark = JsonlBenchmark::open(
        &config.dataset,
        &dataset_path,
        JsonlBenchmark::mode_for_dataset(&config.dataset),
    )?;
    let items = benchmark.load(config.n_items, config.seed)?;
    let fingerprint = sample_fingerprint(&items);

    check_manifest(&store, &run_id, &config, &items, &fingerprint)?;

    if let Some(baseline_run) = &args.baseline_run {
        config.baseline_reference = Some(baseline_from_run(&store, baseline_run)?);
    }

    let generator: Box<dyn TextGenerator> = if args.dry_run {
        Box::new(DryRunGenerator::new())
    } else {
        Box::new(OpenAiCompatClient::from_env(
            &config.model_id,
            config.request_timeout(),
        )?)
    };

    let budget = BudgetGovernor::new(
        &run_id,
        &config.budget_limits(),
        items.len(),
        config.tasks_per_item(),
    );
    resume_budget(&store, &run_id, &budget)?;

    let logger = DualChannelLogger::open(&args.cache_root.join("logs"), &run_id, Sanitizer::new()?)?;
    info!(private_log = %logger.private_path().display(), "detailed event log");
    let halt = HaltSignal::with_stop_file(&run_dir.join(STOP_FILENAME));
    let pricing = PriceTable::with_overrides(&config.pricing);
    if !pricing.is_known(&config.model_id) {
        warn!(model_id = %config.model_id, "no price entry for model, using default pricing");
    }
    let prompts = DefaultPrompts;

    info!(
        run_id = %run_id,
        variant = config.variant.as_str(),
        dataset = benchmark.dataset(),
        model_id = %config.model_id,
        items = items.len(),
        mamv = config.mamv_enabled,
        dry_run = args.dry_run,
        "run session starting"
    );

    let executor = PipelineExecutor {
        run_id: &run_id,
        config: &config,
        generator: generator.as_ref(),
        prompts: &prompts,
        benchmark: &benchmark,
        budget: &budget,
        logger: &logger,
        store: &store,
        pricing: &pricing,
        halt: &halt,
        retry: config.retry_policy(),
    };
    let runner = BatchRunner {
        executor: &executor,
        aggregator: MajorityVoteAggregator::new(config.default_vote_temperature),
        workers: config.workers,
    };

    let (report, batch_error) = match runner.run(&items) {
        Ok(report) => (report, None),
        Err(err) => (
            BatchReport {
                total_items: items.len(),
                ..BatchReport::default()
            },
            Some(err),
        ),
    };

    let summary = build_summary(
        &store,
        &config,
        &run_id,
        items.len(),
        &report,
        budget.snapshot(),
        &halt,
    )?;
    let summary_path = args
        .summary_path
        .clone()
        .unwrap_or_else(|| default_summary_path(&run_dir, &run_id));
    write_json_pretty(&summary_path, &summary)?;
    info!(path = %summary_path.display(), "wrote run summary");

    if !budget.is_within_ratio_target(&summary.budget) {
        warn!(
            run_id = %run_id,
            cost_ratio = ?summary.budget.cost_ratio(),
            target = ?config.cost_ratio_target,
            "run cost is over the baseline ratio target"
        );
    }

    if logger.blocked_shared_writes() > 0 {
        warn!(
            run_id = %run_id,
            blocked = logger.blocked_shared_writes(),
            "shared-channel writes were blocked by the sanitizer"
        );
    }

    if let Some(err) = batch_error {
        return Err(err).context(format!("run {run_id} aborted"));
    }
    if halt.cause() == Some(HaltCause::FatalConfig) {
        bail!(PipelineError::FatalConfig(halt.reason().unwrap_or_default()));
    }

    Ok(summary)
}

fn default_summary_path(run_dir: &Path, run_id: &str) -> PathBuf {
    run_dir.join(format!("summary_{run_id}.json"))
}

/// First session records the sample; later sessions must reproduce it.
fn check_manifest(
    store: &Store,
    run_id: &str,
    config: &RunConfig,
    items: &[WorkItem],
    fingerprint: &str,
) -> Result<(), PipelineError> {
    let now = now_utc_string();
    let manifest = RunManifest {
        run_id: run_id.to_string(),
        variant: config.variant.as_str().to_string(),
        dataset: config.dataset.clone(),
        model_id: config.model_id.clone(),
        seed: config.seed,
        n_items: items.len(),
        sample_fingerprint: fingerprint.to_string(),
        mamv_enabled: config.mamv_enabled,
        mamv_instances: config.mamv_instances,
        config_json: serde_json::to_string(config)?,
        created_at: now.clone(),
        updated_at: now,
    };

    if let Some(existing) = store.load_manifest(run_id)? {
        let mismatches: Vec<String> = [
            ("dataset", existing.dataset.clone(), manifest.dataset.clone()),
            ("variant", existing.variant.clone(), manifest.variant.clone()),
            ("model_id", existing.model_id.clone(), manifest.model_id.clone()),
            (
                "sample_fingerprint",
                existing.sample_fingerprint.clone(),
                manifest.sample_fingerprint.clone(),
            ),
            ("seed", existing.seed.to_string(), manifest.seed.to_string()),
            (
                "mamv_enabled",
                existing.mamv_enabled.to_string(),
                manifest.mamv_enabled.to_string(),
            ),
            (
                "mamv_instances",
                existing.mamv_instances.to_string(),
                manifest.mamv_instances.to_string(),
            ),
        ]
        .into_iter()
        .filter(|(_, stored, current)| stored != current)
        .map(|(field, stored, current)| format!("{field}: stored {stored}, requested {current}"))
        .collect();

        if !mismatches.is_empty() {
            return Err(PipelineError::FatalConfig(format!(
                "run {run_id} cannot resume with different settings ({})",
                mismatches.join("; ")
            )));
        }
        info!(run_id, created_at = %existing.created_at, "resuming existing run");
    }

    store.upsert_manifest(&manifest)
}

fn baseline_from_run(store: &Store, baseline_run: &str) -> Result<BaselineReference, PipelineError> {
    let totals = store.run_totals(baseline_run)?;
    if totals.stage_count == 0 {
        return Err(PipelineError::FatalConfig(format!(
            "baseline run {baseline_run} has no persisted stage results"
        )));
    }
    info!(
        baseline_run,
        tokens = totals.usage.total,
        cost = totals.cost,
        "loaded baseline reference"
    );
    Ok(BaselineReference {
        tokens: totals.usage.total,
        cost: totals.cost,
    })
}

/// Seeds the governor with what earlier sessions already spent.
fn resume_budget(store: &Store, run_id: &str, budget: &BudgetGovernor) -> Result<(), PipelineError> {
    let totals = store.run_totals(run_id)?;
    if totals.stage_count == 0 {
        return Ok(());
    }

    let instances = budget.snapshot().tasks_per_item;
    let over_cap = store
        .item_results(run_id)?
        .into_iter()
        .filter(|row| !budget.check_item_cap(&TokenUsage::new(row.total_tokens, 0), instances))
        .map(|row| row.item_id)
        .collect();
    let processed = store.completed_count(run_id)?;
    budget.resume_from(totals.usage, totals.cost, processed, over_cap);

    info!(
        run_id,
        tokens = totals.usage.total,
        cost = totals.cost,
        processed,
        "budget resumed from persisted totals"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::cli::Variant;

    fn write_dataset(dir: &Path, count: usize) -> PathBuf {
        let path = dir.join("gsm8k.jsonl");
        let lines: Vec<String> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "question": format!("What is {i} + {i}?"),
                    "answer": format!("{i} + {i} = {}\n#### {}", 2 * i, 2 * i),
                })
                .to_string()
            })
            .collect();
        fs::write(&path, lines.join("\n")).expect("write dataset");
        path
    }

    fn dry_args(cache_root: &Path, dataset_path: PathBuf) -> RunArgs {
        RunArgs {
            cache_root: cache_root.to_path_buf(),
            run_id: Some("smoke".to_string()),
            dataset: Some("gsm8k".to_string()),
            dataset_path: Some(dataset_path),
            n_items: Some(4),
            seed: Some(7),
            variant: Some(Variant::Dialectical),
            workers: Some(2),
            dry_run: true,
            ..RunArgs::default()
        }
    }

    #[test]
    fn dry_run_writes_summary_and_resumes_without_new_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_root = dir.path().join("cache");
        let dataset = write_dataset(dir.path(), 10);
        let args = dry_args(&cache_root, dataset);

        let first = execute(&args).expect("first session");
        assert_eq!(first.n_items, 4);
        assert_eq!(first.processed_items, 4);
        assert_eq!(first.succeeded, 4);
        assert!(first.total_tokens > 0);
        assert!(
            cache_root
                .join("runs/smoke/summary_smoke.json")
                .is_file()
        );
        assert!(cache_root.join("logs/shared/smoke.jsonl").is_file());

        let second = execute(&args).expect("second session");
        assert_eq!(second.processed_items, 0);
        assert_eq!(second.skipped_completed, 4);
        assert_eq!(second.total_tokens, first.total_tokens);

        let store = Store::open(&cache_root).expect("store");
        let counts = store.run_counts("smoke").expect("counts");
        assert_eq!(counts.stage_results, 12);
        assert_eq!(counts.ledger_completed, 4);
    }

    #[test]
    fn resume_with_different_seed_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_root = dir.path().join("cache");
        let dataset = write_dataset(dir.path(), 10);
        let mut args = dry_args(&cache_root, dataset);
        args.n_items = Some(2);
        execute(&args).expect("first session");

        args.seed = Some(8);
        let err = execute(&args).expect_err("seed change must fail");
        let message = format!("{err:#}");
        assert!(message.contains("fatal configuration error"), "{message}");
        assert!(message.contains("seed"), "{message}");
    }

    #[test]
    fn resume_with_different_model_or_voting_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_root = dir.path().join("cache");
        let dataset = write_dataset(dir.path(), 10);
        let mut args = dry_args(&cache_root, dataset);
        args.n_items = Some(1);
        execute(&args).expect("first session");

        let mut other_model = args.clone();
        other_model.model_id = Some("gpt-4".to_string());
        let message = format!("{:#}", execute(&other_model).expect_err("model change must fail"));
        assert!(message.contains("model_id"), "{message}");

        let mut voting = args.clone();
        voting.mamv = true;
        let message = format!("{:#}", execute(&voting).expect_err("voting change must fail"));
        assert!(message.contains("mamv_enabled"), "{message}");
    }

    #[test]
    fn missing_dataset_path_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = RunArgs {
            cache_root: dir.path().to_path_buf(),
            dry_run: true,
            ..RunArgs::default()
        };
        let err = execute(&args).expect_err("no dataset");
        assert!(format!("{err:#}").contains("dataset_path is required"));
    }

    #[test]
    fn stop_file_halts_before_any_item() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_root = dir.path().join("cache");
        let dataset = write_dataset(dir.path(), 10);
        let args = dry_args(&cache_root, dataset);
        let run_dir = cache_root.join("runs/smoke");
        fs::create_dir_all(&run_dir).expect("run dir");
        fs::write(run_dir.join(STOP_FILENAME), b"").expect("stop file");

        let summary = execute(&args).expect("halted session still summarizes");
        assert!(summary.halted);
        assert_eq!(summary.processed_items, 0);
        assert_eq!(summary.total_tokens, 0);
    }
}
