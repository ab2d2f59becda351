use std::collections::BTreeMap;

use rusqlite::params;
use serde::Serialize;

use super::Store;
use super::ledger::mark_completed;
use crate::error::PipelineError;
use crate::model::{ItemError, ItemOutcome, PipelineRun, RunStatus, StageResult, TokenUsage};
use crate::util::now_utc_string;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub usage: TokenUsage,
    pub cost: f64,
    pub stage_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResultRow {
    pub item_id: String,
    pub is_correct: bool,
    pub status: RunStatus,
    pub total_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunCounts {
    pub stage_results: usize,
    pub pipeline_runs: BTreeMap<String, usize>,
    pub item_results: usize,
    pub failed_items: usize,
    pub stage_failures: usize,
    pub ledger_completed: usize,
}

impl Store {
    /// Appends one StageResult row. Raw text stays out of the table; only
    /// hashes and character counts are stored.
    pub fn insert_stage_result(
        &self,
        run_id: &str,
        instance_index: u32,
        result: &StageResult,
    ) -> Result<(), PipelineError> {
        let connection = self.lock();
        connection.execute(
            "
            INSERT INTO stage_results(
              run_id, item_id, pipeline_run_id, instance_index, stage_index,
              stage_name, temperature, prompt_tokens, completion_tokens,
              total_tokens, cost, prompt_hash, response_hash, input_chars,
              output_chars, attempt_count, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
            params![
                run_id,
                result.item_id,
                result.pipeline_run_id,
                i64::from(instance_index),
                result.stage_index as i64,
                result.stage_name.as_str(),
                result.temperature,
                result.token_usage.prompt as i64,
                result.token_usage.completion as i64,
                result.token_usage.total as i64,
                result.cost,
                result.prompt_hash,
                result.response_hash,
                result.input_text.chars().count() as i64,
                result.output_text.chars().count() as i64,
                i64::from(result.attempt_count),
                result.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_pipeline_run(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let connection = self.lock();
        let usage = run.total_usage();
        connection.execute(
            "
            INSERT INTO pipeline_runs(
              pipeline_run_id, run_id, item_id, instance_index, instance_seed,
              instance_temperature, status, stage_count, final_answer,
              total_tokens, cost, failed_stage, error_class, error, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(pipeline_run_id) DO UPDATE SET
              status=excluded.status,
              stage_count=excluded.stage_count,
              final_answer=excluded.final_answer,
              total_tokens=excluded.total_tokens,
              cost=excluded.cost,
              failed_stage=excluded.failed_stage,
              error_class=excluded.error_class,
              error=excluded.error,
              updated_at=excluded.updated_at
            ",
            params![
                run.pipeline_run_id,
                run.run_id,
                run.item_id,
                i64::from(run.instance.instance_index),
                run.instance.seed as i64,
                run.instance.temperature,
                run.status.as_str(),
                run.stages.len() as i64,
                run.final_answer,
                usage.total as i64,
                run.total_cost(),
                run.failure.as_ref().map(|failure| failure.stage.as_str()),
                run.failure
                    .as_ref()
                    .and_then(|failure| failure.class)
                    .map(|class| class.as_str()),
                run.failure.as_ref().map(|failure| failure.message.as_str()),
                now_utc_string(),
            ],
        )?;
        Ok(())
    }

    /// Appends the failure of `run`. Unlike the pipeline_runs row, which a
    /// retry overwrites, this record is kept for the run summary.
    pub fn record_stage_failure(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let Some(failure) = &run.failure else {
            return Ok(());
        };
        let connection = self.lock();
        connection.execute(
            "
            INSERT INTO stage_failures(
              run_id, item_id, pipeline_run_id, instance_index, stage_name,
              attempts, error_class, error, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                run.run_id,
                run.item_id,
                run.pipeline_run_id,
                i64::from(run.instance.instance_index),
                failure.stage.as_str(),
                i64::from(failure.attempts),
                failure.class.map(|class| class.as_str()),
                failure.message,
                now_utc_string(),
            ],
        )?;
        Ok(())
    }

    /// Writes the item verdict and, for succeeded items, the ledger entry in
    /// one transaction. Failed items stay out of the ledger so a later
    /// session retries them.
    pub fn record_item_outcome(&self, outcome: &ItemOutcome) -> Result<(), PipelineError> {
        let mut connection = self.lock();
        let vote_counts_json = serde_json::to_string(&outcome.vote_counts)?;
        let now = now_utc_string();

        let transaction = connection.transaction()?;
        transaction.execute(
            "
            INSERT INTO item_results(
              run_id, item_id, expected_answer, predicted_answer, is_correct,
              status, decision, vote_counts_json, prompt_tokens,
              completion_tokens, total_tokens, cost, error, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(run_id, item_id) DO UPDATE SET
              predicted_answer=excluded.predicted_answer,
              is_correct=excluded.is_correct,
              status=excluded.status,
              decision=excluded.decision,
              vote_counts_json=excluded.vote_counts_json,
              prompt_tokens=excluded.prompt_tokens,
              completion_tokens=excluded.completion_tokens,
              total_tokens=excluded.total_tokens,
              cost=excluded.cost,
              error=excluded.error,
              updated_at=excluded.updated_at
            ",
            params![
                outcome.run_id,
                outcome.item_id,
                outcome.expected_answer,
                outcome.predicted_answer,
                i64::from(outcome.is_correct),
                outcome.status.as_str(),
                outcome.decision.as_str(),
                vote_counts_json,
                outcome.usage.prompt as i64,
                outcome.usage.completion as i64,
                outcome.usage.total as i64,
                outcome.cost,
                outcome.error,
                now,
            ],
        )?;

        if outcome.status == RunStatus::Succeeded {
            mark_completed(&transaction, &outcome.run_id, &outcome.item_id, &now)?;
        }

        transaction.commit()?;
        Ok(())
    }

    /// Sums every StageResult persisted for the run, across sessions.
    pub fn run_totals(&self, run_id: &str) -> Result<RunTotals, PipelineError> {
        let connection = self.lock();
        let (prompt, completion, cost, count): (i64, i64, f64, i64) = connection.query_row(
            "
            SELECT COALESCE(SUM(prompt_tokens), 0),
                   COALESCE(SUM(completion_tokens), 0),
                   COALESCE(SUM(cost), 0.0),
                   COUNT(*)
            FROM stage_results
            WHERE run_id = ?1
            ",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(RunTotals {
            usage: TokenUsage::new(prompt as u64, completion as u64),
            cost,
            stage_count: count as usize,
        })
    }

    pub fn item_results(&self, run_id: &str) -> Result<Vec<ItemResultRow>, PipelineError> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "
            SELECT item_id, is_correct, status, total_tokens, cost
            FROM item_results
            WHERE run_id = ?1
            ORDER BY item_id
            ",
        )?;
        let mut rows = statement.query(params![run_id])?;
        let mut results = Vec::new();

        while let Some(row) = rows.next()? {
            let status: String = row.get(2)?;
            results.push(ItemResultRow {
                item_id: row.get(0)?,
                is_correct: row.get::<_, i64>(1)? != 0,
                status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                total_tokens: row.get::<_, i64>(3)? as u64,
                cost: row.get(4)?,
            });
        }

        Ok(results)
    }

    /// Every stage failure of the run in the order it happened, including
    /// failures on items a later session completed.
    pub fn item_errors(&self, run_id: &str) -> Result<Vec<ItemError>, PipelineError> {
        let connection = self.lock();
        let mut statement = connection.prepare(
            "
            SELECT item_id, stage_name, error
            FROM stage_failures
            WHERE run_id = ?1
            ORDER BY row_id
            ",
        )?;
        let errors = statement
            .query_map(params![run_id], |row| {
                Ok(ItemError {
                    item_id: row.get(0)?,
                    stage: row.get(1)?,
                    message: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    pub fn run_counts(&self, run_id: &str) -> Result<RunCounts, PipelineError> {
        let connection = self.lock();
        let count = |sql: &str| -> Result<usize, rusqlite::Error> {
            connection
                .query_row(sql, params![run_id], |row| row.get::<_, i64>(0))
                .map(|value| value as usize)
        };

        let stage_results = count("SELECT COUNT(*) FROM stage_results WHERE run_id = ?1")?;
        let item_results = count("SELECT COUNT(*) FROM item_results WHERE run_id = ?1")?;
        let failed_items =
            count("SELECT COUNT(*) FROM item_results WHERE run_id = ?1 AND status = 'failed'")?;
        let stage_failures = count("SELECT COUNT(*) FROM stage_failures WHERE run_id = ?1")?;
        let ledger_completed = count("SELECT COUNT(*) FROM ledger WHERE run_id = ?1")?;

        let mut statement = connection.prepare(
            "SELECT status, COUNT(*) FROM pipeline_runs WHERE run_id = ?1 GROUP BY status ORDER BY status",
        )?;
        let pipeline_runs = statement
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(RunCounts {
            stage_results,
            pipeline_runs,
            item_results,
            failed_items,
            stage_failures,
            ledger_completed,
        })
    }
}
