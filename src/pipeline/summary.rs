use super::batch::BatchReport;
use super::halt::HaltSignal;
use crate::budget::BudgetState;
use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::model::{RunStatus, RunSummary};
use crate::store::Store;
use crate::util::now_utc_string;

/// Builds the run summary from persisted rows, so the totals cover every
/// session of the run and equal the sum of the stored stage results.
pub fn build_summary(
    store: &Store,
    config: &RunConfig,
    run_id: &str,
    n_items: usize,
    report: &BatchReport,
    budget: BudgetState,
    halt: &HaltSignal,
) -> Result<RunSummary, PipelineError> {
    let totals = store.run_totals(run_id)?;
    let rows = store.item_results(run_id)?;
    let error_details = store.item_errors(run_id)?;

    let succeeded = rows
        .iter()
        .filter(|row| row.status == RunStatus::Succeeded)
        .count();
    let failed = rows.len() - succeeded;
    let correct = rows.iter().filter(|row| row.is_correct).count();
    let accuracy = if rows.is_empty() {
        0.0
    } else {
        correct as f64 / rows.len() as f64
    };

    Ok(RunSummary {
        run_id: run_id.to_string(),
        variant: config.variant,
        dataset: config.dataset.clone(),
        model_id: config.model_id.clone(),
        mamv_enabled: config.mamv_enabled,
        n_items,
        processed_items: report.processed,
        skipped_completed: report.skipped_completed,
        succeeded,
        failed,
        correct,
        accuracy,
        total_tokens: totals.usage.total,
        prompt_tokens: totals.usage.prompt,
        completion_tokens: totals.usage.completion,
        total_cost: totals.cost,
        errors: error_details.len(),
        error_details,
        budget,
        halted: halt.is_halted(),
        halt_reason: halt.reason(),
        generated_at: now_utc_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Variant;
    use crate::generation::ServiceError;
    use crate::pipeline::batch::BatchRunner;
    use crate::pipeline::executor::tests::{Harness, ScriptedGenerator, reply, work_item};
    use crate::voting::MajorityVoteAggregator;

    #[test]
    fn summary_totals_equal_stage_totals_across_sessions() {
        let config = RunConfig {
            variant: Variant::Baseline,
            ..RunConfig::default()
        };
        let harness = Harness::new(config.clone(), 3);
        let items: Vec<_> = (0..3).map(|i| work_item(&format!("gsm8k-{i:04}"))).collect();
        let generator = ScriptedGenerator::with_script(vec![
            reply("Final: 4"),
            Err(ServiceError::Http {
                status: 400,
                message: "bad request".to_string(),
                retry_after_ms: None,
            }),
            reply("Final: 7"),
        ]);
        let executor = harness.executor(&generator);
        let runner = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 1,
        };

        runner.run(&items).expect("first session");
        let report = runner.run(&items).expect("second session");
        let summary = build_summary(
            &harness.store,
            &config,
            "run-t",
            items.len(),
            &report,
            harness.budget.snapshot(),
            &harness.halt,
        )
        .expect("summary");

        let stage_tokens: u64 = 3 * 150;
        assert_eq!(summary.total_tokens, stage_tokens);
        assert_eq!(summary.budget.cumulative_tokens, stage_tokens);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.correct, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.error_details[0].item_id, "gsm8k-0001");
        assert_eq!(summary.error_details[0].stage.as_deref(), Some("baseline"));
        assert!((summary.accuracy - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.processed, 1);
        assert!(!summary.halted);
    }
}
