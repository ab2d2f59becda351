use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};

use super::Store;
use crate::error::PipelineError;

impl Store {
    pub fn is_completed(&self, run_id: &str, item_id: &str) -> Result<bool, PipelineError> {
        let connection = self.lock();
        let found = connection
            .query_row(
                "SELECT 1 FROM ledger WHERE run_id = ?1 AND item_id = ?2",
                params![run_id, item_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn completed_ids(&self, run_id: &str) -> Result<HashSet<String>, PipelineError> {
        let connection = self.lock();
        let mut statement = connection.prepare("SELECT item_id FROM ledger WHERE run_id = ?1")?;
        let ids = statement
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn completed_count(&self, run_id: &str) -> Result<usize, PipelineError> {
        let connection = self.lock();
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM ledger WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Idempotent: marking an item twice keeps the first completion time.
/// Takes the connection so callers can write it inside their own transaction.
pub(super) fn mark_completed(
    connection: &Connection,
    run_id: &str,
    item_id: &str,
    completed_at: &str,
) -> Result<(), rusqlite::Error> {
    connection.execute(
        "
        INSERT INTO ledger(run_id, item_id, completed_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(run_id, item_id) DO NOTHING
        ",
        params![run_id, item_id, completed_at],
    )?;
    Ok(())
}
