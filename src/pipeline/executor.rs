use tracing::{debug, error, info, warn};

use super::halt::{HaltCause, HaltSignal};
use super::prompts::PromptBuilder;
use crate::backoff::{ErrorClass, RetryPolicy, call_with_retry};
use crate::benchmark::BenchmarkLoader;
use crate::budget::{BudgetGovernor, BudgetState};
use crate::cli::ItemCapMode;
use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::events::{DualChannelLogger, StageEvent};
use crate::generation::{GenerationRequest, TextGenerator};
use crate::model::{
    InstanceParams, PipelineRun, RunStatus, StageFailure, StageName, StageResult, StageResultDraft,
    WorkItem,
};
use crate::pricing::PriceTable;
use crate::store::Store;

pub const HALTED_REASON: &str = "halted";

/// Everything one pipeline run needs, borrowed from the batch.
pub struct PipelineExecutor<'a> {
    pub run_id: &'a str,
    pub config: &'a RunConfig,
    pub generator: &'a dyn TextGenerator,
    pub prompts: &'a dyn PromptBuilder,
    pub benchmark: &'a dyn BenchmarkLoader,
    pub budget: &'a BudgetGovernor,
    pub logger: &'a DualChannelLogger,
    pub store: &'a Store,
    pub pricing: &'a PriceTable,
    pub halt: &'a HaltSignal,
    pub retry: RetryPolicy,
}

impl PipelineExecutor<'_> {
    /// Runs the stage chain for one item and instance.
    ///
    /// Stage failures end the run as `Failed` and are returned inside the
    /// `PipelineRun`; an `Err` means storage or logging broke and the batch
    /// must stop. Every StageResult is persisted before the next stage starts.
    pub fn run_pipeline(
        &self,
        item: &WorkItem,
        instance: InstanceParams,
    ) -> Result<PipelineRun, PipelineError> {
        let mut run = PipelineRun::new(self.run_id, &item.id, instance);
        run.status = RunStatus::Running;
        self.store.upsert_pipeline_run(&run)?;

        for (stage_index, stage) in self.config.chain().iter().copied().enumerate() {
            if self.halt.is_halted() {
                return self.fail(run, stage, None, 0, HALTED_REASON.to_string());
            }

            if self.config.item_cap_mode == ItemCapMode::HardStop {
                let used = run.total_usage();
                if !self.budget.check_item_cap(&used, 1) {
                    let message = PipelineError::BudgetExceeded(format!(
                        "{} used {} tokens before {}, cap {}",
                        run.pipeline_run_id,
                        used.total,
                        stage.as_str(),
                        self.budget.instance_cap()
                    ))
                    .to_string();
                    return self.fail(run, stage, None, 0, message);
                }
            }

            match self.run_stage(item, &run, stage_index, stage)? {
                Ok(result) => {
                    run.push_stage(result)?;
                }
                Err(failure) => {
                    return self.fail(
                        run,
                        stage,
                        failure.class,
                        failure.attempts,
                        failure.message,
                    );
                }
            }
        }

        run.final_answer = run
            .last_output()
            .and_then(|output| self.benchmark.normalize(output));
        run.status = RunStatus::Succeeded;
        self.store.upsert_pipeline_run(&run)?;

        debug!(
            run_id = self.run_id,
            item_id = %item.id,
            instance = instance.instance_index,
            tokens = run.total_usage().total,
            has_answer = run.final_answer.is_some(),
            "pipeline run succeeded"
        );
        Ok(run)
    }

    /// One external call with retries. The outer `Result` carries run-level
    /// errors, the inner one a stage failure.
    fn run_stage(
        &self,
        item: &WorkItem,
        run: &PipelineRun,
        stage_index: usize,
        stage: StageName,
    ) -> Result<Result<StageResult, StageFailure>, PipelineError> {
        let temperature = self
            .config
            .stage_temperature(&run.instance, stage_index, stage);
        let prompt = self.prompts.build(stage, item, &run.stages);
        let request = GenerationRequest {
            prompt,
            temperature,
            max_tokens: self.config.max_tokens_per_stage,
            model_id: self.config.model_id.clone(),
            seed: Some(run.instance.seed),
        };

        let outcome = call_with_retry(
            &self.retry,
            |_| self.generator.generate(&request),
            |notice| {
                let delay_ms = notice.delay.as_millis() as u64;
                let message = notice.error.to_string();
                warn!(
                    run_id = self.run_id,
                    item_id = %item.id,
                    stage = stage.as_str(),
                    attempt = notice.attempt,
                    class = notice.class.as_str(),
                    delay_ms,
                    "stage call failed, retrying"
                );
                let event = StageEvent::StageRetry {
                    run_id: self.run_id,
                    item_id: &item.id,
                    pipeline_run_id: &run.pipeline_run_id,
                    stage,
                    attempt: notice.attempt,
                    class: notice.class,
                    delay_ms,
                    error: &message,
                };
                if let Err(err) = self.logger.emit(&event) {
                    error!(error = %err, "failed to record retry event");
                }
            },
        );

        let (response, attempts) = match outcome {
            Ok(value) => value,
            Err(failure) => {
                if failure.error.is_credential_failure() {
                    let fatal = PipelineError::FatalConfig(format!(
                        "credentials rejected by text-generation service: {}",
                        failure.error
                    ));
                    self.halt.trigger(HaltCause::FatalConfig, &fatal.to_string());
                }
                let stage_error = PipelineError::StageFailed {
                    stage: stage.as_str().to_string(),
                    attempts: failure.attempts,
                    class: failure.class,
                    message: failure.error.to_string(),
                };
                return Ok(Err(StageFailure {
                    stage,
                    class: Some(failure.class),
                    attempts: failure.attempts,
                    message: stage_error.to_string(),
                }));
            }
        };

        let cost = self.pricing.estimate_cost(
            &self.config.model_id,
            response.prompt_tokens,
            response.completion_tokens,
        );
        let result = StageResult::from_call(
            StageResultDraft {
                item_id: &item.id,
                pipeline_run_id: &run.pipeline_run_id,
                stage_index,
                stage_name: stage,
                temperature,
                attempt_count: attempts,
                cost,
            },
            request.prompt,
            response.text,
            response.prompt_tokens,
            response.completion_tokens,
        );

        self.store
            .insert_stage_result(self.run_id, run.instance.instance_index, &result)?;
        let state = self.budget.update_and_status(&result.token_usage, cost);
        self.logger.emit(&StageEvent::StageCompleted {
            run_id: self.run_id,
            instance_index: run.instance.instance_index,
            result: &result,
        })?;
        self.report_budget(&state)?;

        Ok(Ok(result))
    }

    fn fail(
        &self,
        mut run: PipelineRun,
        stage: StageName,
        class: Option<ErrorClass>,
        attempts: u32,
        message: String,
    ) -> Result<PipelineRun, PipelineError> {
        if message == HALTED_REASON {
            info!(
                run_id = self.run_id,
                item_id = %run.item_id,
                stage = stage.as_str(),
                "pipeline run interrupted by halt"
            );
        } else {
            warn!(
                run_id = self.run_id,
                item_id = %run.item_id,
                stage = stage.as_str(),
                attempts,
                error = %message,
                "pipeline run failed"
            );
        }

        self.logger.emit(&StageEvent::StageFailed {
            run_id: self.run_id,
            item_id: &run.item_id,
            pipeline_run_id: &run.pipeline_run_id,
            stage,
            attempts,
            class,
            error: &message,
        })?;

        run.status = RunStatus::Failed;
        run.failure = Some(StageFailure {
            stage,
            class,
            attempts,
            message,
        });
        self.store.upsert_pipeline_run(&run)?;
        self.store.record_stage_failure(&run)?;
        Ok(run)
    }

    /// Alerts once per level and, when configured, turns an exhausted run
    /// cap into a halt.
    pub fn report_budget(&self, state: &BudgetState) -> Result<(), PipelineError> {
        if let Some(level) = self.budget.take_alert(state) {
            let message = self.budget.format_alert(state);
            warn!("{message}");
            self.logger.emit(&StageEvent::BudgetAlert {
                level,
                state,
                message: &message,
            })?;
        }

        if self.config.budget_hard_stop && state.is_run_cap_exhausted() && !self.halt.is_halted() {
            let reason = PipelineError::BudgetExceeded(format!(
                "cost ${:.4} reached run cap ${:.2}",
                state.cumulative_cost, state.run_cap
            ));
            self.halt
                .trigger(HaltCause::BudgetHardStop, &reason.to_string());
        }
        Ok(())
    }
}

pub fn is_halt_interruption(run: &PipelineRun) -> bool {
    run.failure
        .as_ref()
        .is_some_and(|failure| failure.message == HALTED_REASON)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::benchmark::{AnswerMode, JsonlBenchmark};
    use crate::cli::Variant;
    use crate::generation::{GenerationResponse, ServiceError};
    use crate::pipeline::prompts::DefaultPrompts;
    use crate::sanitize::Sanitizer;

    /// Replays queued responses; answers `Final: 4` once the queue is empty.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        pub script: Mutex<VecDeque<Result<GenerationResponse, ServiceError>>>,
        pub calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub fn with_script(script: Vec<Result<GenerationResponse, ServiceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    pub(crate) fn reply(text: &str) -> Result<GenerationResponse, ServiceError> {
        Ok(GenerationResponse {
            text: text.to_string(),
            prompt_tokens: 100,
            completion_tokens: 50,
        })
    }

    impl TextGenerator for ScriptedGenerator {
        fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
            self.calls.lock().push(request.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| reply("Final: 4"))
        }
    }

    pub(crate) struct Harness {
        _dir: tempfile::TempDir,
        pub config: RunConfig,
        pub store: Store,
        pub logger: DualChannelLogger,
        pub budget: BudgetGovernor,
        pub pricing: PriceTable,
        pub halt: HaltSignal,
        pub benchmark: JsonlBenchmark,
    }

    impl Harness {
        pub fn new(config: RunConfig, total_items: usize) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let dataset = dir.path().join("items.jsonl");
            std::fs::write(&dataset, "{\"question\": \"2+2?\", \"answer\": \"#### 4\"}\n")
                .expect("dataset");
            let budget = BudgetGovernor::new(
                "run-t",
                &config.budget_limits(),
                total_items,
                config.tasks_per_item(),
            );
            Self {
                store: Store::open_in_memory().expect("store"),
                logger: DualChannelLogger::open(
                    &dir.path().join("logs"),
                    "run-t",
                    Sanitizer::new().expect("sanitizer"),
                )
                .expect("logger"),
                budget,
                pricing: PriceTable::default(),
                halt: HaltSignal::new(),
                benchmark: JsonlBenchmark::open("gsm8k", &dataset, AnswerMode::Numeric)
                    .expect("benchmark"),
                config,
                _dir: dir,
            }
        }

        pub fn executor<'a>(&'a self, generator: &'a dyn TextGenerator) -> PipelineExecutor<'a> {
            PipelineExecutor {
                run_id: "run-t",
                config: &self.config,
                generator,
                prompts: &DefaultPrompts,
                benchmark: &self.benchmark,
                budget: &self.budget,
                logger: &self.logger,
                store: &self.store,
                pricing: &self.pricing,
                halt: &self.halt,
                retry: RetryPolicy {
                    max_retries: self.config.max_retries,
                    base: Duration::ZERO,
                    cap: Duration::ZERO,
                    jitter: false,
                },
            }
        }
    }

    pub(crate) fn work_item(id: &str) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            prompt_payload: "What is 2 + 2?".to_string(),
            expected_answer: "4".to_string(),
        }
    }

    fn plain_instance() -> InstanceParams {
        InstanceParams {
            instance_index: 0,
            seed: 42,
            temperature: None,
        }
    }

    #[test]
    fn dialectical_chain_runs_three_ordered_stages() {
        let harness = Harness::new(RunConfig::default(), 1);
        let generator = ScriptedGenerator::with_script(vec![
            reply("2 + 2 = 4\nFinal: 4"),
            reply("Looks right."),
            reply("Confirmed.\nFinal: 4"),
        ]);

        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            run.stages.iter().map(|s| s.stage_name).collect::<Vec<_>>(),
            vec![StageName::Thesis, StageName::Antithesis, StageName::Synthesis]
        );
        assert_eq!(run.final_answer.as_deref(), Some("4"));

        let calls = generator.calls.lock();
        assert_eq!(
            calls.iter().map(|c| c.temperature).collect::<Vec<_>>(),
            vec![0.7, 0.5, 0.2]
        );
        assert!(calls[2].prompt.contains("Looks right."));

        let totals = harness.store.run_totals("run-t").expect("totals");
        assert_eq!(totals.usage, run.total_usage());
        assert_eq!(harness.budget.snapshot().cumulative_tokens, run.total_usage().total);
    }

    #[test]
    fn transient_errors_are_retried_and_counted() {
        let harness = Harness::new(
            RunConfig {
                variant: Variant::Baseline,
                ..RunConfig::default()
            },
            1,
        );
        let generator = ScriptedGenerator::with_script(vec![
            Err(ServiceError::Timeout("slow".to_string())),
            Err(ServiceError::Http {
                status: 429,
                message: "rate limit".to_string(),
                retry_after_ms: None,
            }),
            reply("Final: 4"),
        ]);

        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stages[0].attempt_count, 3);

        let shared = std::fs::read_to_string(harness.logger.shared_path()).expect("shared log");
        assert_eq!(shared.matches("\"stage_retry\"").count(), 2);
    }

    #[test]
    fn exhausted_retries_fail_the_run_and_keep_partial_stages() {
        let harness = Harness::new(RunConfig::default(), 1);
        let unavailable = || {
            Err(ServiceError::Http {
                status: 503,
                message: "unavailable".to_string(),
                retry_after_ms: None,
            })
        };
        let generator = ScriptedGenerator::with_script(vec![
            reply("Final: 4"),
            unavailable(),
            unavailable(),
            unavailable(),
            unavailable(),
        ]);

        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stages.len(), 1);
        let failure = run.failure.expect("failure recorded");
        assert_eq!(failure.stage, StageName::Antithesis);
        assert_eq!(failure.attempts, 4);
        assert_eq!(harness.store.run_totals("run-t").expect("totals").stage_count, 1);
        assert_eq!(generator.calls.lock().len(), 5);
    }

    #[test]
    fn credential_failure_halts_the_batch() {
        let harness = Harness::new(RunConfig::default(), 1);
        let generator = ScriptedGenerator::with_script(vec![Err(ServiceError::Http {
            status: 401,
            message: "invalid api key".to_string(),
            retry_after_ms: None,
        })]);

        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(harness.halt.cause(), Some(HaltCause::FatalConfig));
        assert_eq!(generator.calls.lock().len(), 1);
    }

    #[test]
    fn halt_stops_before_next_stage() {
        let harness = Harness::new(RunConfig::default(), 1);
        harness.halt.trigger(HaltCause::External, "operator");
        let generator = ScriptedGenerator::default();

        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");
        assert!(is_halt_interruption(&run));
        assert!(generator.calls.lock().is_empty());

        let errors = harness.store.item_errors("run-t").expect("errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage.as_deref(), Some("thesis"));
        assert_eq!(errors[0].message, HALTED_REASON);
    }

    #[test]
    fn hard_stop_item_cap_fails_between_stages() {
        let harness = Harness::new(
            RunConfig {
                item_token_cap: 100,
                item_cap_mode: ItemCapMode::HardStop,
                ..RunConfig::default()
            },
            1,
        );
        let generator = ScriptedGenerator::default();
        let run = harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stages.len(), 1);
        assert!(run.failure.expect("failure").message.contains("budget exceeded"));
    }

    #[test]
    fn budget_hard_stop_triggers_halt() {
        let harness = Harness::new(
            RunConfig {
                variant: Variant::Baseline,
                model_id: "gpt-4".to_string(),
                run_budget_cap: 0.001,
                budget_hard_stop: true,
                ..RunConfig::default()
            },
            10,
        );
        let generator = ScriptedGenerator::default();
        harness
            .executor(&generator)
            .run_pipeline(&work_item("gsm8k-0000"), plain_instance())
            .expect("pipeline");

        assert_eq!(harness.halt.cause(), Some(HaltCause::BudgetHardStop));
        let shared = std::fs::read_to_string(harness.logger.shared_path()).expect("shared log");
        assert!(shared.contains("\"budget_alert\""));
    }
}
