use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::config::RunConfig;
use crate::store::{DB_FILENAME, RunCounts, RunManifest, RunTotals, Store};

#[derive(Debug)]
pub struct RunStatusReport {
    pub manifest: RunManifest,
    pub counts: RunCounts,
    pub totals: RunTotals,
    pub run_budget_cap: f64,
}

impl RunStatusReport {
    pub fn budget_used_pct(&self) -> f64 {
        if self.run_budget_cap > 0.0 {
            self.totals.cost / self.run_budget_cap * 100.0
        } else {
            0.0
        }
    }
}

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args.cache_root.join(DB_FILENAME);
    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "run database missing");
        return Ok(());
    }

    let store = Store::open(&args.cache_root)?;
    let run_ids = match &args.run_id {
        Some(run_id) => vec![run_id.clone()],
        None => store.list_run_ids()?,
    };
    if run_ids.is_empty() {
        warn!("no runs recorded");
    }

    for run_id in run_ids {
        match load_report(&store, &run_id)? {
            Some(report) => log_report(&report),
            None => warn!(run_id = %run_id, "run manifest missing"),
        }
    }

    Ok(())
}

pub fn load_report(store: &Store, run_id: &str) -> Result<Option<RunStatusReport>> {
    let Some(manifest) = store.load_manifest(run_id)? else {
        return Ok(None);
    };
    let config: RunConfig = serde_json::from_str(&manifest.config_json)
        .with_context(|| format!("failed to parse stored config for run {run_id}"))?;
    let counts = store.run_counts(run_id)?;
    let totals = store.run_totals(run_id)?;

    Ok(Some(RunStatusReport {
        manifest,
        counts,
        totals,
        run_budget_cap: config.run_budget_cap,
    }))
}

fn log_report(report: &RunStatusReport) {
    let manifest = &report.manifest;
    info!(
        run_id = %manifest.run_id,
        variant = %manifest.variant,
        dataset = %manifest.dataset,
        model_id = %manifest.model_id,
        seed = manifest.seed,
        n_items = manifest.n_items,
        mamv = manifest.mamv_enabled,
        mamv_instances = manifest.mamv_instances,
        sample_fingerprint = %manifest.sample_fingerprint,
        created_at = %manifest.created_at,
        updated_at = %manifest.updated_at,
        "run manifest"
    );

    let pipeline_runs = report
        .counts
        .pipeline_runs
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(",");
    info!(
        run_id = %manifest.run_id,
        completed = report.counts.ledger_completed,
        remaining = manifest.n_items.saturating_sub(report.counts.ledger_completed),
        item_results = report.counts.item_results,
        failed_items = report.counts.failed_items,
        stage_failures = report.counts.stage_failures,
        stage_results = report.counts.stage_results,
        pipeline_runs = %pipeline_runs,
        "run progress"
    );

    info!(
        run_id = %manifest.run_id,
        total_tokens = report.totals.usage.total,
        prompt_tokens = report.totals.usage.prompt,
        completion_tokens = report.totals.usage.completion,
        total_cost = %format!("${:.4}", report.totals.cost),
        run_budget_cap = %format!("${:.2}", report.run_budget_cap),
        budget_used_pct = %format!("{:.2}", report.budget_used_pct()),
        "run budget"
    );
}
