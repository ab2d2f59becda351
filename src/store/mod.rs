use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::util::{ensure_directory, now_utc_string};

mod ledger;
mod results;

pub use results::{ItemResultRow, RunCounts, RunTotals};

pub const DB_FILENAME: &str = "runs.sqlite";

/// Run database shared by all workers. Every statement runs under one
/// connection lock, which serializes ledger and result writes.
pub struct Store {
    connection: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub variant: String,
    pub dataset: String,
    pub model_id: String,
    pub seed: u64,
    pub n_items: usize,
    pub sample_fingerprint: String,
    pub mamv_enabled: bool,
    pub mamv_instances: u32,
    pub config_json: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Store {
    pub fn open(cache_root: &Path) -> Result<Self> {
        ensure_directory(cache_root)?;
        let db_path = cache_root.join(DB_FILENAME);
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock()
    }

    pub fn load_manifest(&self, run_id: &str) -> Result<Option<RunManifest>, PipelineError> {
        let connection = self.lock();
        let manifest = connection
            .query_row(
                "
                SELECT run_id, variant, dataset, model_id, seed, n_items,
                       sample_fingerprint, mamv_enabled, mamv_instances,
                       config_json, created_at, updated_at
                FROM run_manifests
                WHERE run_id = ?1
                ",
                params![run_id],
                |row| {
                    Ok(RunManifest {
                        run_id: row.get(0)?,
                        variant: row.get(1)?,
                        dataset: row.get(2)?,
                        model_id: row.get(3)?,
                        seed: row.get::<_, i64>(4)? as u64,
                        n_items: row.get::<_, i64>(5)? as usize,
                        sample_fingerprint: row.get(6)?,
                        mamv_enabled: row.get::<_, i64>(7)? != 0,
                        mamv_instances: row.get::<_, i64>(8)? as u32,
                        config_json: row.get(9)?,
                        created_at: row.get(10)?,
                        updated_at: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(manifest)
    }

    /// Inserts the manifest on first use; later sessions only bump
    /// `updated_at`, so the original sampling parameters stay authoritative.
    pub fn upsert_manifest(&self, manifest: &RunManifest) -> Result<(), PipelineError> {
        let connection = self.lock();
        connection.execute(
            "
            INSERT INTO run_manifests(
              run_id, variant, dataset, model_id, seed, n_items,
              sample_fingerprint, mamv_enabled, mamv_instances,
              config_json, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(run_id) DO UPDATE SET
              updated_at=excluded.updated_at
            ",
            params![
                manifest.run_id,
                manifest.variant,
                manifest.dataset,
                manifest.model_id,
                manifest.seed as i64,
                manifest.n_items as i64,
                manifest.sample_fingerprint,
                i64::from(manifest.mamv_enabled),
                i64::from(manifest.mamv_instances),
                manifest.config_json,
                manifest.created_at,
                now_utc_string(),
            ],
        )?;
        Ok(())
    }

    pub fn list_run_ids(&self) -> Result<Vec<String>, PipelineError> {
        let connection = self.lock();
        let mut statement =
            connection.prepare("SELECT run_id FROM run_manifests ORDER BY created_at, run_id")?;
        let run_ids = statement
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(run_ids)
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(std::time::Duration::from_secs(5))
        .context("failed to set busy timeout")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS run_manifests (
              run_id TEXT PRIMARY KEY,
              variant TEXT NOT NULL,
              dataset TEXT NOT NULL,
              model_id TEXT NOT NULL,
              seed INTEGER NOT NULL,
              n_items INTEGER NOT NULL,
              sample_fingerprint TEXT NOT NULL,
              mamv_enabled INTEGER NOT NULL,
              mamv_instances INTEGER NOT NULL,
              config_json TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stage_results (
              row_id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              item_id TEXT NOT NULL,
              pipeline_run_id TEXT NOT NULL,
              instance_index INTEGER NOT NULL,
              stage_index INTEGER NOT NULL,
              stage_name TEXT NOT NULL,
              temperature REAL NOT NULL,
              prompt_tokens INTEGER NOT NULL,
              completion_tokens INTEGER NOT NULL,
              total_tokens INTEGER NOT NULL,
              cost REAL NOT NULL,
              prompt_hash TEXT NOT NULL,
              response_hash TEXT NOT NULL,
              input_chars INTEGER NOT NULL,
              output_chars INTEGER NOT NULL,
              attempt_count INTEGER NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stage_results_run
              ON stage_results(run_id, item_id);

            CREATE TABLE IF NOT EXISTS pipeline_runs (
              pipeline_run_id TEXT PRIMARY KEY,
              run_id TEXT NOT NULL,
              item_id TEXT NOT NULL,
              instance_index INTEGER NOT NULL,
              instance_seed INTEGER NOT NULL,
              instance_temperature REAL,
              status TEXT NOT NULL,
              stage_count INTEGER NOT NULL,
              final_answer TEXT,
              total_tokens INTEGER NOT NULL,
              cost REAL NOT NULL,
              failed_stage TEXT,
              error_class TEXT,
              error TEXT,
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_run
              ON pipeline_runs(run_id, status);

            CREATE TABLE IF NOT EXISTS stage_failures (
              row_id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              item_id TEXT NOT NULL,
              pipeline_run_id TEXT NOT NULL,
              instance_index INTEGER NOT NULL,
              stage_name TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              error_class TEXT,
              error TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stage_failures_run
              ON stage_failures(run_id, item_id);

            CREATE TABLE IF NOT EXISTS item_results (
              run_id TEXT NOT NULL,
              item_id TEXT NOT NULL,
              expected_answer TEXT NOT NULL,
              predicted_answer TEXT,
              is_correct INTEGER NOT NULL,
              status TEXT NOT NULL,
              decision TEXT NOT NULL,
              vote_counts_json TEXT NOT NULL,
              prompt_tokens INTEGER NOT NULL,
              completion_tokens INTEGER NOT NULL,
              total_tokens INTEGER NOT NULL,
              cost REAL NOT NULL,
              error TEXT,
              updated_at TEXT NOT NULL,
              PRIMARY KEY(run_id, item_id)
            );

            CREATE TABLE IF NOT EXISTS ledger (
              run_id TEXT NOT NULL,
              item_id TEXT NOT NULL,
              completed_at TEXT NOT NULL,
              PRIMARY KEY(run_id, item_id)
            );
            ",
        )
        .context("failed to create run database schema")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{ItemOutcome, RunStatus, TokenUsage, VoteDecision};

    pub(crate) fn item_outcome(run_id: &str, item_id: &str, status: RunStatus) -> ItemOutcome {
        let succeeded = status == RunStatus::Succeeded;
        ItemOutcome {
            run_id: run_id.to_string(),
            item_id: item_id.to_string(),
            expected_answer: "4".to_string(),
            predicted_answer: succeeded.then(|| "4".to_string()),
            is_correct: succeeded,
            status,
            decision: VoteDecision::Single,
            vote_counts: BTreeMap::new(),
            usage: TokenUsage::new(10, 0),
            cost: 0.001,
            error: (!succeeded).then(|| "stage failed".to_string()),
        }
    }

    fn manifest(run_id: &str, fingerprint: &str) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            variant: "dialectical".to_string(),
            dataset: "gsm8k".to_string(),
            model_id: "deepseek-chat".to_string(),
            seed: 42,
            n_items: 50,
            sample_fingerprint: fingerprint.to_string(),
            mamv_enabled: true,
            mamv_instances: 3,
            config_json: "{}".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn manifest_keeps_original_sampling_parameters() {
        let store = Store::open_in_memory().expect("store");
        assert!(store.load_manifest("run-1").expect("query").is_none());

        store.upsert_manifest(&manifest("run-1", "abc")).expect("insert");
        store.upsert_manifest(&manifest("run-1", "different")).expect("update");

        let loaded = store.load_manifest("run-1").expect("query").expect("manifest");
        assert_eq!(loaded.sample_fingerprint, "abc");
        assert_eq!(loaded.mamv_instances, 3);
        assert!(loaded.mamv_enabled);
    }

    #[test]
    fn lists_runs_in_creation_order() {
        let store = Store::open_in_memory().expect("store");
        let mut later = manifest("b-run", "x");
        later.created_at = "2026-02-01T00:00:00.000Z".to_string();
        store.upsert_manifest(&later).expect("insert b");
        store.upsert_manifest(&manifest("z-run", "y")).expect("insert z");

        assert_eq!(store.list_run_ids().expect("list"), vec!["z-run", "b-run"]);
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("cache");
        let _store = Store::open(&root).expect("store");
        assert!(root.join(DB_FILENAME).exists());
    }
}
