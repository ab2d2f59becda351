use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::warn;

use crate::backoff::ErrorClass;
use crate::budget::{AlertLevel, BudgetState};
use crate::error::PipelineError;
use crate::model::{ItemOutcome, StageName, StageResult};
use crate::sanitize::{Sanitizer, SharedRecord};
use crate::util::{ensure_directory, now_utc_string, sha256_hex};

#[derive(Debug)]
pub enum StageEvent<'a> {
    StageCompleted {
        run_id: &'a str,
        instance_index: u32,
        result: &'a StageResult,
    },
    StageRetry {
        run_id: &'a str,
        item_id: &'a str,
        pipeline_run_id: &'a str,
        stage: StageName,
        attempt: u32,
        class: ErrorClass,
        delay_ms: u64,
        error: &'a str,
    },
    StageFailed {
        run_id: &'a str,
        item_id: &'a str,
        pipeline_run_id: &'a str,
        stage: StageName,
        attempts: u32,
        class: Option<ErrorClass>,
        error: &'a str,
    },
    ItemCompleted {
        outcome: &'a ItemOutcome,
        instances: usize,
    },
    BudgetAlert {
        level: AlertLevel,
        state: &'a BudgetState,
        message: &'a str,
    },
    RunHalted {
        run_id: &'a str,
        reason: &'a str,
    },
}

impl StageEvent<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageRetry { .. } => "stage_retry",
            Self::StageFailed { .. } => "stage_failed",
            Self::ItemCompleted { .. } => "item_completed",
            Self::BudgetAlert { .. } => "budget_alert",
            Self::RunHalted { .. } => "run_halted",
        }
    }

    /// Full record with raw text, for the private channel only.
    pub fn private_record(&self, timestamp: &str) -> Value {
        let event = self.kind();
        match self {
            Self::StageCompleted {
                run_id,
                instance_index,
                result,
            } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": run_id,
                "instance_index": instance_index,
                "item_id": result.item_id,
                "pipeline_run_id": result.pipeline_run_id,
                "stage": result.stage_name.as_str(),
                "stage_index": result.stage_index,
                "temperature": result.temperature,
                "input_text": result.input_text,
                "output_text": result.output_text,
                "prompt_tokens": result.token_usage.prompt,
                "completion_tokens": result.token_usage.completion,
                "total_tokens": result.token_usage.total,
                "cost": result.cost,
                "prompt_hash": result.prompt_hash,
                "response_hash": result.response_hash,
                "attempt_count": result.attempt_count,
                "stage_timestamp": result.timestamp,
            }),
            Self::StageRetry {
                run_id,
                item_id,
                pipeline_run_id,
                stage,
                attempt,
                class,
                delay_ms,
                error,
            } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": run_id,
                "item_id": item_id,
                "pipeline_run_id": pipeline_run_id,
                "stage": stage.as_str(),
                "attempt": attempt,
                "error_class": class.as_str(),
                "delay_ms": delay_ms,
                "error": error,
            }),
            Self::StageFailed {
                run_id,
                item_id,
                pipeline_run_id,
                stage,
                attempts,
                class,
                error,
            } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": run_id,
                "item_id": item_id,
                "pipeline_run_id": pipeline_run_id,
                "stage": stage.as_str(),
                "attempt_count": attempts,
                "error_class": class.map(ErrorClass::as_str),
                "error": error,
            }),
            Self::ItemCompleted { outcome, instances } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": outcome.run_id,
                "item_id": outcome.item_id,
                "instances": instances,
                "status": outcome.status.as_str(),
                "expected_answer": outcome.expected_answer,
                "predicted_answer": outcome.predicted_answer,
                "is_correct": outcome.is_correct,
                "decision": outcome.decision.as_str(),
                "vote_counts": outcome.vote_counts,
                "total_tokens": outcome.usage.total,
                "cost": outcome.cost,
                "error": outcome.error,
            }),
            Self::BudgetAlert {
                level,
                state,
                message,
            } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": state.run_id,
                "alert_level": alert_level_str(*level),
                "budget": state,
                "message": message,
            }),
            Self::RunHalted { run_id, reason } => json!({
                "event": event,
                "timestamp": timestamp,
                "run_id": run_id,
                "reason": reason,
            }),
        }
    }

    /// Whitelisted projection for the shared channel.
    pub fn shared_record(&self, timestamp: &str, sanitizer: &Sanitizer) -> SharedRecord {
        let base = SharedRecord {
            event: self.kind().to_string(),
            timestamp: timestamp.to_string(),
            ..SharedRecord::default()
        };

        match self {
            Self::StageCompleted {
                run_id,
                instance_index,
                result,
            } => SharedRecord {
                run_id: run_id.to_string(),
                item_id: Some(result.item_id.clone()),
                pipeline_run_id: Some(result.pipeline_run_id.clone()),
                instance_index: Some(*instance_index),
                stage: Some(result.stage_name.as_str().to_string()),
                stage_index: Some(result.stage_index),
                temperature: Some(result.temperature),
                prompt_tokens: Some(result.token_usage.prompt),
                completion_tokens: Some(result.token_usage.completion),
                total_tokens: Some(result.token_usage.total),
                cost: Some(result.cost),
                prompt_hash: Some(result.prompt_hash.clone()),
                response_hash: Some(result.response_hash.clone()),
                input_chars: Some(result.input_text.chars().count()),
                output_chars: Some(result.output_text.chars().count()),
                attempt_count: Some(result.attempt_count),
                ..base
            },
            Self::StageRetry {
                run_id,
                item_id,
                pipeline_run_id,
                stage,
                attempt,
                class,
                delay_ms,
                error,
            } => SharedRecord {
                run_id: run_id.to_string(),
                item_id: Some(item_id.to_string()),
                pipeline_run_id: Some(pipeline_run_id.to_string()),
                stage: Some(stage.as_str().to_string()),
                attempt: Some(*attempt),
                error_class: Some(class.as_str().to_string()),
                delay_ms: Some(*delay_ms),
                error: Some(sanitizer.shared_text(error)),
                ..base
            },
            Self::StageFailed {
                run_id,
                item_id,
                pipeline_run_id,
                stage,
                attempts,
                class,
                error,
            } => SharedRecord {
                run_id: run_id.to_string(),
                item_id: Some(item_id.to_string()),
                pipeline_run_id: Some(pipeline_run_id.to_string()),
                stage: Some(stage.as_str().to_string()),
                attempt_count: Some(*attempts),
                error_class: class.map(|class| class.as_str().to_string()),
                error: Some(sanitizer.shared_text(error)),
                ..base
            },
            Self::ItemCompleted { outcome, instances } => SharedRecord {
                run_id: outcome.run_id.clone(),
                item_id: Some(outcome.item_id.clone()),
                instances: Some(*instances),
                status: Some(outcome.status.as_str().to_string()),
                is_correct: Some(outcome.is_correct),
                answer_hash: outcome.predicted_answer.as_deref().map(sha256_hex),
                decision: Some(outcome.decision.as_str().to_string()),
                consensus_votes: outcome
                    .predicted_answer
                    .as_ref()
                    .and_then(|answer| outcome.vote_counts.get(answer).copied()),
                total_tokens: Some(outcome.usage.total),
                cost: Some(outcome.cost),
                error: outcome.error.as_deref().map(|error| sanitizer.shared_text(error)),
                ..base
            },
            Self::BudgetAlert { level, state, .. } => SharedRecord {
                run_id: state.run_id.clone(),
                alert_level: Some(alert_level_str(*level).to_string()),
                budget_used_pct: Some(state.budget_used_pct()),
                cumulative_tokens: Some(state.cumulative_tokens),
                cumulative_cost: Some(state.cumulative_cost),
                projected_total_cost: Some(state.projected_total_cost()),
                processed_items: Some(state.processed_items),
                total_items: Some(state.total_items),
                items_over_cap: Some(state.items_over_cap.len()),
                ..base
            },
            Self::RunHalted { run_id, reason } => SharedRecord {
                run_id: run_id.to_string(),
                reason: Some(sanitizer.shared_text(reason)),
                ..base
            },
        }
    }
}

fn alert_level_str(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Warning => "warning",
        AlertLevel::Exceeded => "exceeded",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOutcome {
    pub shared_written: bool,
}

/// Appends every event to a private JSONL file (full text) and a shared
/// JSONL file (sanitized projection). Each line is written under its own
/// lock, so concurrent workers never interleave within a record.
pub struct DualChannelLogger {
    private: Mutex<File>,
    shared: Mutex<File>,
    private_path: PathBuf,
    shared_path: PathBuf,
    sanitizer: Sanitizer,
    blocked_shared: AtomicUsize,
}

impl DualChannelLogger {
    pub fn open(log_root: &Path, run_id: &str, sanitizer: Sanitizer) -> Result<Self> {
        let private_dir = log_root.join("private");
        let shared_dir = log_root.join("shared");
        ensure_directory(&private_dir)?;
        ensure_directory(&shared_dir)?;

        let private_path = private_dir.join(format!("{run_id}.jsonl"));
        let shared_path = shared_dir.join(format!("{run_id}.jsonl"));

        Ok(Self {
            private: Mutex::new(open_append(&private_path)?),
            shared: Mutex::new(open_append(&shared_path)?),
            private_path,
            shared_path,
            sanitizer,
            blocked_shared: AtomicUsize::new(0),
        })
    }

    pub fn private_path(&self) -> &Path {
        &self.private_path
    }

    pub fn shared_path(&self) -> &Path {
        &self.shared_path
    }

    pub fn blocked_shared_writes(&self) -> usize {
        self.blocked_shared.load(Ordering::Relaxed)
    }

    /// Writes the private record, then the shared projection. A sanitization
    /// failure blocks only the shared line.
    pub fn emit(&self, event: &StageEvent<'_>) -> Result<EmitOutcome, PipelineError> {
        let timestamp = now_utc_string();

        let private_line = serde_json::to_string(&event.private_record(&timestamp))?;
        append_line(&self.private, &private_line)?;

        let shared = event.shared_record(&timestamp, &self.sanitizer);
        match self.sanitizer.project(&shared) {
            Ok(map) => {
                let shared_line = serde_json::to_string(&map)?;
                append_line(&self.shared, &shared_line)?;
                Ok(EmitOutcome {
                    shared_written: true,
                })
            }
            Err(err) => {
                self.blocked_shared.fetch_add(1, Ordering::Relaxed);
                warn!(event = event.kind(), error = %err, "shared event write blocked");
                Ok(EmitOutcome {
                    shared_written: false,
                })
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open event log: {}", path.display()))
}

fn append_line(file: &Mutex<File>, line: &str) -> Result<(), PipelineError> {
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');

    let mut file = file.lock();
    file.write_all(record.as_bytes())?;
    file.flush()?;
    Ok(())
}
