use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::{error, info};

use super::executor::{PipelineExecutor, is_halt_interruption};
use super::halt::HaltCause;
use crate::error::PipelineError;
use crate::events::StageEvent;
use crate::model::{InstanceVote, ItemOutcome, PipelineRun, RunStatus, TokenUsage, WorkItem};
use crate::voting::MajorityVoteAggregator;

#[derive(Debug, Default)]
pub struct BatchReport {
    pub total_items: usize,
    pub skipped_completed: usize,
    pub processed: usize,
    pub interrupted: usize,
    pub outcomes: Vec<ItemOutcome>,
}

/// Bounded worker pool over the pending items of one run. Items are
/// independent; the stages of one item run on a single worker.
pub struct BatchRunner<'a> {
    pub executor: &'a PipelineExecutor<'a>,
    pub aggregator: MajorityVoteAggregator,
    pub workers: usize,
}

impl BatchRunner<'_> {
    pub fn run(&self, items: &[WorkItem]) -> Result<BatchReport, PipelineError> {
        let executor = self.executor;
        let completed = executor.store.completed_ids(executor.run_id)?;
        let pending: Vec<&WorkItem> = items
            .iter()
            .filter(|item| !completed.contains(&item.id))
            .collect();
        let skipped_completed = items.len() - pending.len();
        let workers = self.workers.max(1).min(pending.len().max(1));

        info!(
            run_id = executor.run_id,
            total = items.len(),
            skipped_completed,
            pending = pending.len(),
            workers,
            "starting batch"
        );

        let next = AtomicUsize::new(0);
        let completed_elsewhere = AtomicUsize::new(0);
        let interrupted = AtomicUsize::new(0);
        let outcomes = Mutex::new(Vec::with_capacity(pending.len()));
        let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);

        let stop_batch = |err: PipelineError| {
            executor.halt.trigger(HaltCause::RunError, &err.to_string());
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if executor.halt.poll_stop_file() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(item) = pending.get(index) else {
                            break;
                        };

                        // Another session sharing the database may have finished it.
                        match executor.store.is_completed(executor.run_id, &item.id) {
                            Ok(true) => {
                                completed_elsewhere.fetch_add(1, Ordering::SeqCst);
                                continue;
                            }
                            Ok(false) => {}
                            Err(err) => {
                                stop_batch(err);
                                break;
                            }
                        }

                        match self.process_item(item) {
                            Ok(Some(outcome)) => outcomes.lock().push(outcome),
                            Ok(None) => {
                                interrupted.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(err) => {
                                error!(
                                    run_id = executor.run_id,
                                    item_id = %item.id,
                                    error = %err,
                                    "run-level failure, stopping batch"
                                );
                                stop_batch(err);
                                break;
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }

        if executor.halt.is_halted() {
            let reason = executor.halt.reason().unwrap_or_default();
            executor.logger.emit(&StageEvent::RunHalted {
                run_id: executor.run_id,
                reason: &reason,
            })?;
        }

        let mut outcomes = outcomes.into_inner();
        outcomes.sort_by(|a, b| a.item_id.cmp(&b.item_id));

        Ok(BatchReport {
            total_items: items.len(),
            skipped_completed: skipped_completed + completed_elsewhere.into_inner(),
            processed: outcomes.len(),
            interrupted: interrupted.into_inner(),
            outcomes,
        })
    }

    /// Runs every instance for one item and folds them into a verdict.
    /// Returns `None` when a halt interrupted the item; nothing is recorded
    /// for it and a later session picks it up again.
    fn process_item(&self, item: &WorkItem) -> Result<Option<ItemOutcome>, PipelineError> {
        let executor = self.executor;
        let config = executor.config;

        let mut runs: Vec<PipelineRun> = Vec::new();
        for instance in config.instances() {
            runs.push(executor.run_pipeline(item, instance)?);
        }

        if runs.iter().any(is_halt_interruption) {
            info!(run_id = executor.run_id, item_id = %item.id, "item interrupted by halt");
            return Ok(None);
        }

        let first_stage = config.chain()[0];
        let votes = runs
            .iter()
            .map(|run| InstanceVote {
                instance_index: run.instance.instance_index,
                instance_seed: run.instance.seed,
                instance_temperature: config.stage_temperature(&run.instance, 0, first_stage),
                final_answer: run.final_answer.clone(),
            })
            .collect();
        let bundle = self.aggregator.reconcile(&item.id, votes);

        let mut usage = TokenUsage::default();
        for run in &runs {
            usage += run.total_usage();
        }
        let cost: f64 = runs.iter().map(PipelineRun::total_cost).sum();

        let any_succeeded = runs.iter().any(|run| run.status == RunStatus::Succeeded);
        let status = if any_succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        let error = if !any_succeeded {
            runs.iter()
                .find_map(|run| run.failure.as_ref())
                .map(|failure| failure.message.clone())
        } else if bundle.consensus_answer.is_none() {
            Some(
                PipelineError::NoConsensus {
                    item_id: item.id.clone(),
                }
                .to_string(),
            )
        } else {
            None
        };
        let is_correct = bundle
            .consensus_answer
            .as_deref()
            .is_some_and(|answer| executor.benchmark.is_correct(&item.expected_answer, answer));

        let outcome = ItemOutcome {
            run_id: executor.run_id.to_string(),
            item_id: item.id.clone(),
            expected_answer: item.expected_answer.clone(),
            predicted_answer: bundle.consensus_answer.clone(),
            is_correct,
            status,
            decision: bundle.decision,
            vote_counts: bundle.vote_counts,
            usage,
            cost,
            error,
        };

        let state = executor.budget.record_item(&item.id, &usage);
        executor.report_budget(&state)?;
        executor.store.record_item_outcome(&outcome)?;
        executor.logger.emit(&StageEvent::ItemCompleted {
            outcome: &outcome,
            instances: runs.len(),
        })?;

        info!(
            run_id = executor.run_id,
            item_id = %item.id,
            status = outcome.status.as_str(),
            correct = outcome.is_correct,
            decision = outcome.decision.as_str(),
            tokens = usage.total,
            progress = %format!("{}/{}", state.processed_items, state.total_items),
            "item completed"
        );

        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Variant;
    use crate::config::RunConfig;
    use crate::generation::ServiceError;
    use crate::model::VoteDecision;
    use crate::pipeline::executor::tests::{Harness, ScriptedGenerator, reply, work_item};
    use crate::store::tests::item_outcome;

    fn items(count: usize) -> Vec<WorkItem> {
        (0..count).map(|i| work_item(&format!("gsm8k-{i:04}"))).collect()
    }

    fn baseline_config() -> RunConfig {
        RunConfig {
            variant: Variant::Baseline,
            workers: 3,
            ..RunConfig::default()
        }
    }

    #[test]
    fn resume_processes_only_uncompleted_items() {
        let harness = Harness::new(baseline_config(), 10);
        let items = items(10);
        for item in items.iter().take(6) {
            harness
                .store
                .record_item_outcome(&item_outcome("run-t", &item.id, RunStatus::Succeeded))
                .expect("mark");
        }

        let generator = ScriptedGenerator::default();
        let executor = harness.executor(&generator);
        let report = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 3,
        }
        .run(&items)
        .expect("batch");

        assert_eq!(report.skipped_completed, 6);
        assert_eq!(report.processed, 4);
        assert_eq!(generator.calls.lock().len(), 4);
        let processed: Vec<&str> = report.outcomes.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(processed, vec!["gsm8k-0006", "gsm8k-0007", "gsm8k-0008", "gsm8k-0009"]);
        assert_eq!(harness.store.completed_count("run-t").expect("count"), 10);

        let again = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 3,
        }
        .run(&items)
        .expect("second resume");
        assert_eq!(again.processed, 0);
        assert_eq!(generator.calls.lock().len(), 4);
    }

    #[test]
    fn failed_item_does_not_abort_batch_and_is_retried_later() {
        let harness = Harness::new(baseline_config(), 2);
        let fatal = Err(ServiceError::Http {
            status: 400,
            message: "context length exceeded".to_string(),
            retry_after_ms: None,
        });
        let generator = ScriptedGenerator::with_script(vec![fatal]);
        let executor = harness.executor(&generator);
        let runner = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 1,
        };

        let report = runner.run(&items(2)).expect("batch");
        assert_eq!(report.processed, 2);
        assert_eq!(report.outcomes[0].status, RunStatus::Failed);
        assert!(!report.outcomes[0].is_correct);
        assert_eq!(report.outcomes[1].status, RunStatus::Succeeded);
        assert!(report.outcomes[1].is_correct);

        let retried = runner.run(&items(2)).expect("resume");
        assert_eq!(retried.skipped_completed, 1);
        assert_eq!(retried.outcomes[0].item_id, "gsm8k-0000");
        assert_eq!(retried.outcomes[0].status, RunStatus::Succeeded);
    }

    #[test]
    fn voting_runs_three_instances_per_item() {
        let harness = Harness::new(
            RunConfig {
                variant: Variant::Baseline,
                mamv_enabled: true,
                ..RunConfig::default()
            },
            1,
        );
        let generator = ScriptedGenerator::with_script(vec![
            reply("Final: 4"),
            reply("Final: 4"),
            reply("Final: 5"),
        ]);
        let executor = harness.executor(&generator);
        let report = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 1,
        }
        .run(&items(1))
        .expect("batch");

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.predicted_answer.as_deref(), Some("4"));
        assert_eq!(outcome.decision, VoteDecision::Majority);
        assert_eq!(outcome.vote_counts.get("5"), Some(&1));
        assert_eq!(outcome.usage.total, 450);

        let calls = generator.calls.lock();
        assert_eq!(
            calls.iter().map(|c| (c.temperature, c.seed)).collect::<Vec<_>>(),
            vec![(0.65, Some(143)), (0.70, Some(244)), (0.75, Some(345))]
        );
        assert_eq!(harness.budget.snapshot().tasks_per_item, 3);
    }

    #[test]
    fn failed_instance_is_recorded_when_the_item_succeeds() {
        let harness = Harness::new(
            RunConfig {
                variant: Variant::Baseline,
                mamv_enabled: true,
                ..RunConfig::default()
            },
            1,
        );
        let generator = ScriptedGenerator::with_script(vec![
            reply("Final: 4"),
            Err(ServiceError::Http {
                status: 400,
                message: "bad request".to_string(),
                retry_after_ms: None,
            }),
            reply("Final: 4"),
        ]);
        let executor = harness.executor(&generator);
        let report = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 1,
        }
        .run(&items(1))
        .expect("batch");

        assert_eq!(report.outcomes[0].status, RunStatus::Succeeded);
        assert_eq!(report.outcomes[0].decision, VoteDecision::Majority);
        let errors = harness.store.item_errors("run-t").expect("errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].item_id, "gsm8k-0000");
    }

    #[test]
    fn halted_batch_leaves_items_for_next_session() {
        let harness = Harness::new(baseline_config(), 3);
        harness.halt.trigger(HaltCause::External, "operator");
        let generator = ScriptedGenerator::default();
        let executor = harness.executor(&generator);
        let report = BatchRunner {
            executor: &executor,
            aggregator: MajorityVoteAggregator::default(),
            workers: 2,
        }
        .run(&items(3))
        .expect("batch");

        assert_eq!(report.processed, 0);
        assert!(generator.calls.lock().is_empty());
        assert_eq!(harness.store.completed_count("run-t").expect("count"), 0);
        let shared = std::fs::read_to_string(harness.logger.shared_path()).expect("shared log");
        assert!(shared.contains("\"run_halted\""));
    }
}
