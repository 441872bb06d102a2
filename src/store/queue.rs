//! Queue item repository.
//!
//! Items for a loop are consumed strictly by ascending position. `dequeue`,
//! `enqueue` and `reorder` run inside `BEGIN IMMEDIATE` transactions so
//! concurrent callers, in this process or another, never interleave.

use std::collections::HashSet;

use log::debug;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::Value;

use super::{ABANDONED_ITEM_ERROR, Store};
use crate::domain::{QueueItem, QueueItemStatus, QueueItemType, QueuePayload};
use crate::error::{LoopdError, Result};
use crate::id::{generate_item_id, now_ms};

const ITEM_COLUMNS: &str = "id, loop_id, position, item_type, status, payload, created_at, completed_at, error";

struct ItemRow {
    id: String,
    loop_id: String,
    position: i64,
    item_type: String,
    status: String,
    payload: String,
    created_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            loop_id: row.get(1)?,
            position: row.get(2)?,
            item_type: row.get(3)?,
            status: row.get(4)?,
            payload: row.get(5)?,
            created_at: row.get(6)?,
            completed_at: row.get(7)?,
            error: row.get(8)?,
        })
    }

    fn into_item(self) -> Result<QueueItem> {
        let item_type: QueueItemType = self.item_type.parse()?;
        let fields: Value = serde_json::from_str(&self.payload)?;
        Ok(QueueItem {
            id: self.id,
            loop_id: self.loop_id,
            position: self.position,
            status: self.status.parse()?,
            payload: QueuePayload::from_parts(item_type, &fields)?,
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}

fn get_in(conn: &Connection, item_id: &str) -> Result<Option<QueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1");
    conn.query_row(&sql, [item_id], ItemRow::from_row)
        .optional()?
        .map(ItemRow::into_item)
        .transpose()
}

fn head_in(conn: &Connection, loop_id: &str) -> Result<Option<QueueItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM queue_items WHERE loop_id = ?1 AND status = 'pending' \
         ORDER BY position LIMIT 1"
    );
    conn.query_row(&sql, [loop_id], ItemRow::from_row)
        .optional()?
        .map(ItemRow::into_item)
        .transpose()
}

fn query_in(conn: &Connection, where_clause: &str, params: impl rusqlite::Params) -> Result<Vec<QueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items {where_clause} ORDER BY position");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, ItemRow::from_row)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?.into_item()?);
    }
    Ok(items)
}

/// Fail every item left `dispatched` on a loop. Used when a dead owner is
/// reclaimed so nothing it was handed runs twice.
pub(super) fn fail_dispatched_in(conn: &Connection, loop_id: &str, now: i64) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE queue_items SET status = 'failed', error = ?2, completed_at = ?3 \
         WHERE loop_id = ?1 AND status = 'dispatched'",
        params![loop_id, ABANDONED_ITEM_ERROR, now],
    )?;
    Ok(changed)
}

/// Repository for queue items.
pub struct QueueRepository<'a> {
    store: &'a Store,
}

impl<'a> QueueRepository<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Validate `fields` for `item_type` and append the item to the loop's queue.
    pub fn enqueue(&self, loop_id: &str, item_type: QueueItemType, fields: &Value) -> Result<QueueItem> {
        let payload = QueuePayload::from_parts(item_type, fields)?;
        self.enqueue_payload(loop_id, payload)
    }

    /// Append an already-typed payload at position max + 1 (0 when empty).
    pub fn enqueue_payload(&self, loop_id: &str, payload: QueuePayload) -> Result<QueueItem> {
        payload.validate()?;

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row("SELECT EXISTS(SELECT 1 FROM loops WHERE id = ?1)", [loop_id], |row| {
            row.get(0)
        })?;
        if !exists {
            return Err(LoopdError::LoopNotFound(loop_id.to_string()));
        }

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM queue_items WHERE loop_id = ?1",
            [loop_id],
            |row| row.get(0),
        )?;

        let item = QueueItem {
            id: generate_item_id(),
            loop_id: loop_id.to_string(),
            position,
            status: QueueItemStatus::Pending,
            payload,
            created_at: now_ms(),
            completed_at: None,
            error: None,
        };

        tx.execute(
            "INSERT INTO queue_items (id, loop_id, position, item_type, status, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                item.loop_id,
                item.position,
                item.item_type().as_str(),
                item.status.as_str(),
                serde_json::to_string(&item.payload.to_fields()?)?,
                item.created_at,
            ],
        )?;
        tx.commit()?;

        debug!("Enqueued {} {} at position {}", item.item_type(), item.id, item.position);
        Ok(item)
    }

    /// Lowest-position pending item, unchanged. `QueueEmpty` if none.
    pub fn peek(&self, loop_id: &str) -> Result<QueueItem> {
        let conn = self.store.conn()?;
        head_in(&conn, loop_id)?.ok_or_else(|| LoopdError::QueueEmpty(loop_id.to_string()))
    }

    /// Atomically take the head item and mark it `dispatched`.
    pub fn dequeue(&self, loop_id: &str) -> Result<QueueItem> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut item = head_in(&tx, loop_id)?.ok_or_else(|| LoopdError::QueueEmpty(loop_id.to_string()))?;
        tx.execute(
            "UPDATE queue_items SET status = 'dispatched' WHERE id = ?1 AND status = 'pending'",
            [&item.id],
        )?;
        tx.commit()?;

        item.status = QueueItemStatus::Dispatched;
        Ok(item)
    }

    /// Take the loop's first pending `stop` item, skipping anything ahead of
    /// it, and mark it `dispatched`. Lets a blocked runner honor a stop.
    pub fn take_stop(&self, loop_id: &str) -> Result<Option<QueueItem>> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE loop_id = ?1 AND status = 'pending' \
             AND item_type = 'stop' ORDER BY position LIMIT 1"
        );
        let item = tx
            .query_row(&sql, [loop_id], ItemRow::from_row)
            .optional()?
            .map(ItemRow::into_item)
            .transpose()?;
        let Some(mut item) = item else {
            return Ok(None);
        };

        tx.execute("UPDATE queue_items SET status = 'dispatched' WHERE id = ?1", [&item.id])?;
        tx.commit()?;

        item.status = QueueItemStatus::Dispatched;
        Ok(Some(item))
    }

    pub fn get(&self, item_id: &str) -> Result<Option<QueueItem>> {
        let conn = self.store.conn()?;
        get_in(&conn, item_id)
    }

    /// All items of a loop ordered by position, history included.
    pub fn list(&self, loop_id: &str) -> Result<Vec<QueueItem>> {
        let conn = self.store.conn()?;
        query_in(&conn, "WHERE loop_id = ?1", [loop_id])
    }

    pub fn list_by_status(&self, loop_id: &str, status: QueueItemStatus) -> Result<Vec<QueueItem>> {
        let conn = self.store.conn()?;
        query_in(&conn, "WHERE loop_id = ?1 AND status = ?2", [loop_id, status.as_str()])
    }

    /// Record the terminal outcome of a dispatched item.
    pub fn update_status(&self, item_id: &str, status: QueueItemStatus, error: Option<&str>) -> Result<()> {
        if !status.is_terminal() {
            return Err(LoopdError::InvalidArgument(format!(
                "queue item status must be completed or failed, got {status}"
            )));
        }

        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE queue_items SET status = ?2, error = ?3, completed_at = ?4 \
             WHERE id = ?1 AND status = 'dispatched'",
            params![item_id, status.as_str(), error, now_ms()],
        )?;
        if changed == 1 {
            return Ok(());
        }

        match get_in(&conn, item_id)? {
            None => Err(LoopdError::QueueItemNotFound(item_id.to_string())),
            Some(item) => Err(LoopdError::InvalidState(format!(
                "queue item {} is {}, not dispatched",
                item_id, item.status
            ))),
        }
    }

    pub fn complete(&self, item_id: &str) -> Result<()> {
        self.update_status(item_id, QueueItemStatus::Completed, None)
    }

    pub fn fail(&self, item_id: &str, error: &str) -> Result<()> {
        self.update_status(item_id, QueueItemStatus::Failed, Some(error))
    }

    pub fn remove(&self, item_id: &str) -> Result<()> {
        let conn = self.store.conn()?;
        let changed = conn.execute("DELETE FROM queue_items WHERE id = ?1", [item_id])?;
        if changed == 0 {
            return Err(LoopdError::QueueItemNotFound(item_id.to_string()));
        }
        Ok(())
    }

    /// Delete every pending item of a loop; history is kept.
    pub fn clear(&self, loop_id: &str) -> Result<usize> {
        let conn = self.store.conn()?;
        let removed = conn.execute(
            "DELETE FROM queue_items WHERE loop_id = ?1 AND status = 'pending'",
            [loop_id],
        )?;
        Ok(removed)
    }

    /// Reassign pending positions to follow `ordered_ids`.
    ///
    /// The id set must equal the current pending set exactly, otherwise
    /// nothing changes.
    pub fn reorder(&self, loop_id: &str, ordered_ids: &[String]) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pending: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, position FROM queue_items WHERE loop_id = ?1 AND status = 'pending' ORDER BY position",
            )?;
            let rows = stmt.query_map([loop_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let current: HashSet<&str> = pending.iter().map(|(id, _)| id.as_str()).collect();
        let requested: HashSet<&str> = ordered_ids.iter().map(String::as_str).collect();
        if requested.len() != ordered_ids.len() || requested != current {
            return Err(LoopdError::InvalidArgument(format!(
                "reorder ids do not match the {} pending items of loop {}",
                pending.len(),
                loop_id
            )));
        }

        // Park on negative positions first so the unique index never collides
        for (index, (id, _)) in pending.iter().enumerate() {
            tx.execute(
                "UPDATE queue_items SET position = ?2 WHERE id = ?1",
                params![id, -(index as i64) - 1],
            )?;
        }
        for (id, (_, position)) in ordered_ids.iter().zip(pending.iter()) {
            tx.execute(
                "UPDATE queue_items SET position = ?2 WHERE id = ?1",
                params![id, position],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Complete the loop's dispatched pause or conditional item, if any.
    ///
    /// This is the explicit resume signal a paused or waiting runner watches for.
    pub fn resume(&self, loop_id: &str) -> Result<Option<QueueItem>> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE loop_id = ?1 AND status = 'dispatched' \
             AND item_type IN ('pause', 'conditional') ORDER BY position LIMIT 1"
        );
        let item = tx
            .query_row(&sql, [loop_id], ItemRow::from_row)
            .optional()?
            .map(ItemRow::into_item)
            .transpose()?;

        let Some(mut item) = item else {
            return Ok(None);
        };

        let now = now_ms();
        tx.execute(
            "UPDATE queue_items SET status = 'completed', completed_at = ?2 WHERE id = ?1",
            params![item.id, now],
        )?;
        tx.commit()?;

        item.status = QueueItemStatus::Completed;
        item.completed_at = Some(now);
        debug!("Resumed {} on loop {}", item.id, loop_id);
        Ok(Some(item))
    }
}
