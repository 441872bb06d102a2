//! Iteration history - append-only, written only by the owning runner.

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use crate::domain::{Decision, IterationResult};
use crate::error::Result;

const ITERATION_COLUMNS: &str = "loop_id, sequence, started_at, finished_at, exit_code, timed_out, \
     stdout_tail, stderr_tail, decision, queue_item_id, error";

struct IterationRow {
    loop_id: String,
    sequence: u32,
    started_at: i64,
    finished_at: i64,
    exit_code: i32,
    timed_out: bool,
    stdout_tail: String,
    stderr_tail: String,
    decision: String,
    queue_item_id: Option<String>,
    error: Option<String>,
}

impl IterationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            loop_id: row.get(0)?,
            sequence: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            exit_code: row.get(4)?,
            timed_out: row.get(5)?,
            stdout_tail: row.get(6)?,
            stderr_tail: row.get(7)?,
            decision: row.get(8)?,
            queue_item_id: row.get(9)?,
            error: row.get(10)?,
        })
    }

    fn into_result(self) -> Result<IterationResult> {
        let decision: Decision = serde_json::from_str(&self.decision)?;
        Ok(IterationResult {
            loop_id: self.loop_id,
            sequence: self.sequence,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            stdout_tail: self.stdout_tail,
            stderr_tail: self.stderr_tail,
            decision,
            queue_item_id: self.queue_item_id,
            error: self.error,
        })
    }
}

/// Insert one iteration row. Sequence numbers are unique per loop.
pub(super) fn insert_iteration(conn: &Connection, result: &IterationResult) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO iterations ({ITERATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            result.loop_id,
            result.sequence,
            result.started_at,
            result.finished_at,
            result.exit_code,
            result.timed_out,
            result.stdout_tail,
            result.stderr_tail,
            serde_json::to_string(&result.decision)?,
            result.queue_item_id,
            result.error,
        ],
    )?;
    Ok(())
}

/// Read access to iteration history.
pub struct IterationRepository<'a> {
    store: &'a Store,
}

impl<'a> IterationRepository<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// All iterations of a loop in sequence order.
    pub fn list(&self, loop_id: &str) -> Result<Vec<IterationResult>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITERATION_COLUMNS} FROM iterations WHERE loop_id = ?1 ORDER BY sequence"
        ))?;
        let rows = stmt.query_map([loop_id], IterationRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_result()?);
        }
        Ok(results)
    }

    pub fn latest(&self, loop_id: &str) -> Result<Option<IterationResult>> {
        let conn = self.store.conn()?;
        conn.query_row(
            &format!("SELECT {ITERATION_COLUMNS} FROM iterations WHERE loop_id = ?1 ORDER BY sequence DESC LIMIT 1"),
            [loop_id],
            IterationRow::from_row,
        )
        .optional()?
        .map(IterationRow::into_result)
        .transpose()
    }

    pub fn count(&self, loop_id: &str) -> Result<usize> {
        let conn = self.store.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM iterations WHERE loop_id = ?1", [loop_id], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}
