use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::CompareArgs;
use crate::error::PipelineError;
use crate::stats::{self, ComparisonResult, ItemScore, VariantResults};
use crate::store::Store;
use crate::util::write_json_pretty;

pub fn run(args: CompareArgs) -> Result<()> {
    let comparison = execute(&args)?;
    log_kpis(&comparison);
    Ok(())
}

pub fn execute(args: &CompareArgs) -> Result<ComparisonResult> {
    let store = Store::open(&args.cache_root)?;
    let a = load_variant(&store, &args.run_a)?;
    let b = load_variant(&store, &args.run_b)?;

    info!(
        run_a = %args.run_a,
        run_b = %args.run_b,
        items_a = a.items.len(),
        items_b = b.items.len(),
        "comparing runs"
    );

    let comparison = match stats::compare(&a, &b) {
        Ok(comparison) => comparison,
        Err(err @ PipelineError::DataMismatch(_)) => {
            warn!(run_a = %args.run_a, run_b = %args.run_b, "no common items, comparison skipped");
            bail!(err);
        }
        Err(err) => return Err(err.into()),
    };

    let output_path = args.output_path.clone().unwrap_or_else(|| {
        args.cache_root
            .join("comparisons")
            .join(format!("comparison_{}_vs_{}.json", args.run_a, args.run_b))
    });
    write_json_pretty(&output_path, &comparison)?;
    info!(path = %output_path.display(), "wrote comparison");

    Ok(comparison)
}

fn load_variant(store: &Store, run_id: &str) -> Result<VariantResults, PipelineError> {
    let mut results = VariantResults::new(run_id);
    for row in store.item_results(run_id)? {
        results.insert(
            &row.item_id,
            ItemScore {
                is_correct: row.is_correct,
                tokens: row.total_tokens,
                cost: row.cost,
            },
        );
    }
    Ok(results)
}

fn format_ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |ratio| format!("{ratio:.2}x"))
}

fn log_kpis(comparison: &ComparisonResult) {
    let table = &comparison.table;
    info!(
        variant_a = %comparison.variant_a,
        variant_b = %comparison.variant_b,
        common_items = comparison.common_item_ids.len(),
        only_in_a = comparison.only_in_a,
        only_in_b = comparison.only_in_b,
        "comparison coverage"
    );
    info!(
        accuracy_a = %format!("{:.2}%", comparison.accuracy_a * 100.0),
        accuracy_b = %format!("{:.2}%", comparison.accuracy_b * 100.0),
        delta_pct = %format!("{:+.2}", comparison.delta_accuracy_pct),
        "accuracy"
    );
    info!(
        both_correct = table.both_correct,
        a_only_correct = table.a_correct_b_wrong,
        b_only_correct = table.a_wrong_b_correct,
        both_wrong = table.both_wrong,
        discordant = table.discordant(),
        "contingency table"
    );
    info!(
        p_value = %format!("{:.4}", comparison.p_value),
        method = ?comparison.method,
        statistic = ?comparison.statistic,
        "mcnemar test"
    );
    info!(
        avg_tokens_a = %format!("{:.1}", comparison.avg_tokens_a),
        avg_tokens_b = %format!("{:.1}", comparison.avg_tokens_b),
        token_ratio = %format_ratio(comparison.token_ratio),
        cost_ratio = %format_ratio(comparison.cost_ratio),
        "efficiency"
    );
    if comparison.low_statistical_power {
        warn!(
            common_items = comparison.common_item_ids.len(),
            "fewer than 30 common items, significance test has low power"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{ItemOutcome, RunStatus, TokenUsage, VoteDecision};
    use crate::stats::McNemarMethod;

    fn outcome(run_id: &str, item_id: &str, is_correct: bool, tokens: u64) -> ItemOutcome {
        ItemOutcome {
            run_id: run_id.to_string(),
            item_id: item_id.to_string(),
            expected_answer: "4".to_string(),
            predicted_answer: Some(if is_correct { "4" } else { "5" }.to_string()),
            is_correct,
            status: RunStatus::Succeeded,
            decision: VoteDecision::Single,
            vote_counts: BTreeMap::new(),
            usage: TokenUsage::new(tokens, 0),
            cost: tokens as f64 / 1000.0,
            error: None,
        }
    }

    #[test]
    fn compares_persisted_runs_and_writes_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("store");
        for i in 0..4 {
            let id = format!("gsm8k-{i:04}");
            store
                .record_item_outcome(&outcome("base", &id, i < 2, 100))
                .expect("base row");
            store
                .record_item_outcome(&outcome("dial", &id, i < 3, 250))
                .expect("dial row");
        }
        store
            .record_item_outcome(&outcome("dial", "gsm8k-0009", true, 250))
            .expect("extra row");
        drop(store);

        let args = CompareArgs {
            cache_root: dir.path().to_path_buf(),
            run_a: "base".to_string(),
            run_b: "dial".to_string(),
            output_path: None,
        };
        let comparison = execute(&args).expect("compare");

        assert_eq!(comparison.common_item_ids.len(), 4);
        assert_eq!(comparison.only_in_b, 1);
        assert_eq!(comparison.table.a_wrong_b_correct, 1);
        assert_eq!(comparison.method, McNemarMethod::ExactBinomial);
        assert!((comparison.delta_accuracy_pct - 25.0).abs() < 1e-9);
        assert_eq!(comparison.token_ratio, Some(2.5));
        assert!(comparison.low_statistical_power);
        assert!(
            dir.path()
                .join("comparisons/comparison_base_vs_dial.json")
                .is_file()
        );
    }

    #[test]
    fn unknown_run_is_a_data_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = CompareArgs {
            cache_root: dir.path().to_path_buf(),
            run_a: "missing-a".to_string(),
            run_b: "missing-b".to_string(),
            output_path: None,
        };
        let err = execute(&args).expect_err("nothing to compare");
        assert!(format!("{err:#}").contains("data mismatch"));
    }
}
