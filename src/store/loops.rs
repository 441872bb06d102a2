//! Loop record repository.
//!
//! Owner fields are only ever written through conditional updates: a claim
//! succeeds when the loop is unowned, already ours, or its heartbeat expired;
//! every later write by the runner is guarded by its instance id.

use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use super::Store;
use super::iterations::insert_iteration;
use super::queue::fail_dispatched_in;
use crate::domain::{IterationResult, LoopConfig, LoopRecord, LoopState, OwnerKind};
use crate::error::{LoopdError, Result};
use crate::id::{generate_loop_id, now_ms, short_id_for};

const LOOP_COLUMNS: &str = "id, name, short_id, config, state, iteration_count, stop_reason, last_error, \
     owner_kind, owner_instance_id, last_heartbeat_at, started_at, created_at, updated_at";

const ACTIVE_STATES: &str = "('running', 'paused', 'stopping')";

/// Raw column values of one `loops` row.
struct LoopRow {
    id: String,
    name: String,
    short_id: String,
    config: String,
    state: String,
    iteration_count: i64,
    stop_reason: Option<String>,
    last_error: Option<String>,
    owner_kind: Option<String>,
    owner_instance_id: Option<String>,
    last_heartbeat_at: Option<i64>,
    started_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl LoopRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            short_id: row.get(2)?,
            config: row.get(3)?,
            state: row.get(4)?,
            iteration_count: row.get(5)?,
            stop_reason: row.get(6)?,
            last_error: row.get(7)?,
            owner_kind: row.get(8)?,
            owner_instance_id: row.get(9)?,
            last_heartbeat_at: row.get(10)?,
            started_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<LoopRecord> {
        let config: LoopConfig = serde_json::from_str(&self.config)?;
        Ok(LoopRecord {
            id: self.id,
            name: self.name,
            short_id: self.short_id,
            config,
            state: self.state.parse()?,
            iteration_count: self.iteration_count as u32,
            stop_reason: self.stop_reason,
            last_error: self.last_error,
            owner_kind: self.owner_kind.map(|kind| kind.parse::<OwnerKind>()).transpose()?,
            owner_instance_id: self.owner_instance_id,
            last_heartbeat_at: self.last_heartbeat_at,
            started_at: self.started_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn get_in(conn: &Connection, id: &str) -> Result<Option<LoopRecord>> {
    let sql = format!("SELECT {LOOP_COLUMNS} FROM loops WHERE id = ?1");
    conn.query_row(&sql, [id], LoopRow::from_row)
        .optional()?
        .map(LoopRow::into_record)
        .transpose()
}

fn query_in(conn: &Connection, where_clause: &str, params: impl rusqlite::Params) -> Result<Vec<LoopRecord>> {
    let sql = format!("SELECT {LOOP_COLUMNS} FROM loops {where_clause} ORDER BY created_at, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, LoopRow::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

/// Map "no row changed" on an owner-guarded write to `OwnershipLost`.
fn expect_owned(changed: usize, loop_id: &str) -> Result<()> {
    if changed == 0 {
        return Err(LoopdError::OwnershipLost(loop_id.to_string()));
    }
    Ok(())
}

/// Repository for loop records.
pub struct LoopRepository<'a> {
    store: &'a Store,
}

impl<'a> LoopRepository<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Create a loop in state `idle`. Names are unique.
    pub fn create(&self, name: &str, config: LoopConfig) -> Result<LoopRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LoopdError::InvalidArgument("loop name is required".into()));
        }
        config.validate()?;

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let taken: bool = tx.query_row("SELECT EXISTS(SELECT 1 FROM loops WHERE name = ?1)", [name], |row| {
            row.get(0)
        })?;
        if taken {
            return Err(LoopdError::InvalidArgument(format!("loop name already exists: {name}")));
        }

        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM loops")?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };

        let mut id = generate_loop_id();
        while existing.contains(&id) {
            id = generate_loop_id();
        }
        let short_id = short_id_for(&id, existing.iter().map(String::as_str));
        let now = now_ms();

        let record = LoopRecord {
            id,
            name: name.to_string(),
            short_id,
            config,
            state: LoopState::Idle,
            iteration_count: 0,
            stop_reason: None,
            last_error: None,
            owner_kind: None,
            owner_instance_id: None,
            last_heartbeat_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        };

        tx.execute(
            "INSERT INTO loops (id, name, short_id, config, state, iteration_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![
                record.id,
                record.name,
                record.short_id,
                serde_json::to_string(&record.config)?,
                record.state.as_str(),
                now,
            ],
        )?;
        tx.commit()?;

        info!("Created loop {} ({})", record.name, record.short_id);
        Ok(record)
    }

    /// Get a loop by exact id.
    pub fn get(&self, id: &str) -> Result<Option<LoopRecord>> {
        let conn = self.store.conn()?;
        get_in(&conn, id)
    }

    /// Get a loop by exact id, failing with `LoopNotFound`.
    pub fn require(&self, id: &str) -> Result<LoopRecord> {
        self.get(id)?.ok_or_else(|| LoopdError::LoopNotFound(id.to_string()))
    }

    /// Find a loop by id, name, short id or unique id prefix.
    pub fn resolve(&self, reference: &str) -> Result<LoopRecord> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(LoopdError::InvalidArgument("loop reference is empty".into()));
        }

        let all = self.list()?;
        if let Some(found) = all
            .iter()
            .find(|r| r.id == reference || r.name == reference || r.short_id == reference)
        {
            return Ok(found.clone());
        }

        let mut matches = all.into_iter().filter(|r| r.id.starts_with(reference));
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            (Some(_), Some(_)) => Err(LoopdError::InvalidArgument(format!(
                "loop reference is ambiguous: {reference}"
            ))),
            _ => Err(LoopdError::LoopNotFound(reference.to_string())),
        }
    }

    pub fn list(&self) -> Result<Vec<LoopRecord>> {
        let conn = self.store.conn()?;
        query_in(&conn, "", [])
    }

    pub fn list_by_state(&self, state: LoopState) -> Result<Vec<LoopRecord>> {
        let conn = self.store.conn()?;
        query_in(&conn, "WHERE state = ?1", [state.as_str()])
    }

    /// Loops an owner is expected to be heartbeating: running, paused, stopping.
    pub fn list_active(&self) -> Result<Vec<LoopRecord>> {
        let conn = self.store.conn()?;
        query_in(&conn, &format!("WHERE state IN {ACTIVE_STATES}"), [])
    }

    pub fn list_owned_by(&self, instance_id: &str) -> Result<Vec<LoopRecord>> {
        let conn = self.store.conn()?;
        query_in(&conn, "WHERE owner_instance_id = ?1", [instance_id])
    }

    /// Claim ownership of a loop for `instance_id`.
    ///
    /// Succeeds only if the loop has no owner, is already owned by
    /// `instance_id`, or the current owner's heartbeat is older than
    /// `stale_threshold_ms`. Losers get `OwnershipConflict`.
    pub fn claim_owner(
        &self,
        loop_id: &str,
        kind: OwnerKind,
        instance_id: &str,
        now: i64,
        stale_threshold_ms: i64,
    ) -> Result<LoopRecord> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = get_in(&tx, loop_id)?.ok_or_else(|| LoopdError::LoopNotFound(loop_id.to_string()))?;

        let changed = tx.execute(
            "UPDATE loops SET owner_kind = ?2, owner_instance_id = ?3, last_heartbeat_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND (owner_instance_id IS NULL OR owner_instance_id = ?3 \
                 OR last_heartbeat_at IS NULL OR last_heartbeat_at < ?5)",
            params![loop_id, kind.as_str(), instance_id, now, now - stale_threshold_ms],
        )?;
        if changed == 0 {
            debug!("Claim on {} by {} lost to {}", loop_id, instance_id, previous.owner_label());
            return Err(LoopdError::OwnershipConflict {
                loop_id: loop_id.to_string(),
                owner: previous.owner_label(),
            });
        }

        // Displacing a dead owner: nothing it was handed may run twice
        if let Some(dead) = previous.owner_instance_id.as_deref()
            && dead != instance_id
        {
            let abandoned = fail_dispatched_in(&tx, loop_id, now)?;
            if abandoned > 0 {
                debug!("Failed {} items abandoned by {} on {}", abandoned, dead, loop_id);
            }
        }

        let record = get_in(&tx, loop_id)?.ok_or_else(|| LoopdError::LoopNotFound(loop_id.to_string()))?;
        tx.commit()?;

        debug!("Loop {} claimed by {}:{}", loop_id, kind, instance_id);
        Ok(record)
    }

    /// Refresh the heartbeat; fails with `OwnershipLost` if no longer owner.
    pub fn heartbeat(&self, loop_id: &str, instance_id: &str, now: i64) -> Result<()> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE loops SET last_heartbeat_at = ?3, updated_at = ?3 WHERE id = ?1 AND owner_instance_id = ?2",
            params![loop_id, instance_id, now],
        )?;
        expect_owned(changed, loop_id)
    }

    /// Enter `running` under the current owner, clearing the last outcome.
    pub fn mark_running(&self, loop_id: &str, instance_id: &str, now: i64) -> Result<()> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE loops SET state = 'running', started_at = ?3, stop_reason = NULL, last_error = NULL, \
                 last_heartbeat_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND owner_instance_id = ?2",
            params![loop_id, instance_id, now],
        )?;
        expect_owned(changed, loop_id)
    }

    /// Persist a state transition together with a heartbeat.
    pub fn set_state(&self, loop_id: &str, instance_id: &str, state: LoopState, now: i64) -> Result<()> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE loops SET state = ?3, last_heartbeat_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND owner_instance_id = ?2",
            params![loop_id, instance_id, state.as_str(), now],
        )?;
        expect_owned(changed, loop_id)
    }

    /// Append an iteration result and advance the loop's counter and
    /// heartbeat in one transaction. Nothing is written if ownership was lost.
    pub fn record_iteration(&self, instance_id: &str, result: &IterationResult, now: i64) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE loops SET iteration_count = ?3, last_heartbeat_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND owner_instance_id = ?2",
            params![result.loop_id, instance_id, result.sequence, now],
        )?;
        expect_owned(changed, &result.loop_id)?;
        insert_iteration(&tx, result)?;
        tx.commit()?;
        Ok(())
    }

    /// Change the replica count recorded in the loop's configuration.
    pub fn set_replicas(&self, loop_id: &str, instance_id: &str, replicas: u32, now: i64) -> Result<()> {
        if replicas == 0 {
            return Err(LoopdError::InvalidArgument("replicas must be at least 1".into()));
        }
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT config FROM loops WHERE id = ?1 AND owner_instance_id = ?2",
                params![loop_id, instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| LoopdError::OwnershipLost(loop_id.to_string()))?;

        let mut config: LoopConfig = serde_json::from_str(&raw)?;
        config.replicas = replicas;
        tx.execute(
            "UPDATE loops SET config = ?2, last_heartbeat_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![loop_id, serde_json::to_string(&config)?, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Give up ownership on clean termination, recording the final state.
    pub fn release_owner(
        &self,
        loop_id: &str,
        instance_id: &str,
        state: LoopState,
        stop_reason: Option<&str>,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE loops SET state = ?3, stop_reason = ?4, last_error = ?5, owner_kind = NULL, \
                 owner_instance_id = NULL, last_heartbeat_at = NULL, updated_at = ?6 \
             WHERE id = ?1 AND owner_instance_id = ?2",
            params![loop_id, instance_id, state.as_str(), stop_reason, last_error, now],
        )?;
        expect_owned(changed, loop_id)?;
        debug!("Loop {} released by {} as {}", loop_id, instance_id, state);
        Ok(())
    }

    /// Reclaim a loop whose owner stopped heartbeating.
    ///
    /// Single conditional update: the owner must still be `expected_owner`,
    /// the state active and the heartbeat older than `stale_before`. Items the
    /// dead owner left dispatched are failed in the same transaction. Returns
    /// false when another sweeper or a fresh heartbeat got there first.
    pub fn reclaim_stale(
        &self,
        loop_id: &str,
        expected_owner: Option<&str>,
        stale_before: i64,
        new_state: LoopState,
        reason: &str,
        now: i64,
    ) -> Result<bool> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            &format!(
                "UPDATE loops SET owner_kind = NULL, owner_instance_id = NULL, last_heartbeat_at = NULL, \
                     state = ?4, stop_reason = ?5, updated_at = ?6 \
                 WHERE id = ?1 AND owner_instance_id IS ?2 AND state IN {ACTIVE_STATES} \
                     AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?3)"
            ),
            params![loop_id, expected_owner, stale_before, new_state.as_str(), reason, now],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let abandoned = fail_dispatched_in(&tx, loop_id, now)?;
        tx.commit()?;

        if abandoned > 0 {
            debug!("Failed {} abandoned queue items on {}", abandoned, loop_id);
        }
        Ok(true)
    }

    /// Stop a loop nobody owns. Returns false if it has an owner.
    pub fn stop_unowned(&self, loop_id: &str, reason: &str, now: i64) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE loops SET state = 'stopped', stop_reason = ?2, updated_at = ?3 \
             WHERE id = ?1 AND owner_instance_id IS NULL",
            params![loop_id, reason, now],
        )?;
        if changed == 0 && get_in(&conn, loop_id)?.is_none() {
            return Err(LoopdError::LoopNotFound(loop_id.to_string()));
        }
        Ok(changed == 1)
    }

    /// Record an error on a loop nobody owns.
    pub fn note_error(&self, loop_id: &str, error: &str, now: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE loops SET last_error = ?2, updated_at = ?3 WHERE id = ?1 AND owner_instance_id IS NULL",
            params![loop_id, error, now],
        )?;
        Ok(())
    }

    /// Delete a loop with its queue and history. Refuses a live owner.
    pub fn remove(&self, loop_id: &str, now: i64, stale_threshold_ms: i64) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = get_in(&tx, loop_id)?.ok_or_else(|| LoopdError::LoopNotFound(loop_id.to_string()))?;
        if record.has_live_owner(now, stale_threshold_ms) {
            return Err(LoopdError::InvalidState(format!(
                "loop {} is owned by {}; stop it first",
                record.name,
                record.owner_label()
            )));
        }

        tx.execute("DELETE FROM iterations WHERE loop_id = ?1", [loop_id])?;
        tx.execute("DELETE FROM queue_items WHERE loop_id = ?1", [loop_id])?;
        tx.execute("DELETE FROM loops WHERE id = ?1", [loop_id])?;
        tx.commit()?;

        info!("Removed loop {} ({})", record.name, record.short_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QueueItemStatus, QueueItemType};
    use crate::domain::{CommandResult, Decision};
    use crate::store::test_support::temp_store;
    use serde_json::json;

    const THRESHOLD: i64 = 45 * 60 * 1000;

    #[test]
    fn test_create_and_get() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("docs", LoopConfig::shell("echo hi")).unwrap();

        assert_eq!(record.state, LoopState::Idle);
        assert_eq!(record.short_id.len(), 6);
        assert!(record.id.starts_with(&record.short_id));
        assert!(record.owner_instance_id.is_none());

        let fetched = store.loops().require(&record.id).unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_create_rejects_duplicate_name() {
        let (store, _temp) = temp_store();
        store.loops().create("docs", LoopConfig::shell("true")).unwrap();
        let err = store.loops().create("docs", LoopConfig::shell("true")).unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let (store, _temp) = temp_store();
        let err = store.loops().create("empty", LoopConfig::default()).unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));
    }

    #[test]
    fn test_require_missing() {
        let (store, _temp) = temp_store();
        assert!(matches!(
            store.loops().require("nope"),
            Err(LoopdError::LoopNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_by_name_short_id_and_prefix() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("docs", LoopConfig::shell("true")).unwrap();

        assert_eq!(store.loops().resolve("docs").unwrap().id, record.id);
        assert_eq!(store.loops().resolve(&record.short_id).unwrap().id, record.id);
        assert_eq!(store.loops().resolve(&record.id[..8]).unwrap().id, record.id);
        assert_eq!(store.loops().resolve(&record.id).unwrap().id, record.id);
        assert!(matches!(
            store.loops().resolve("missing"),
            Err(LoopdError::LoopNotFound(_))
        ));
    }

    #[test]
    fn test_claim_owner_single_winner() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("race", LoopConfig::shell("true")).unwrap();
        let now = now_ms();

        let won = store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "local-a", now, THRESHOLD)
            .unwrap();
        assert_eq!(won.owner_instance_id.as_deref(), Some("local-a"));
        assert_eq!(won.owner_kind, Some(OwnerKind::Local));

        let lost = store
            .loops()
            .claim_owner(&record.id, OwnerKind::Daemon, "daemon-b", now, THRESHOLD)
            .unwrap_err();
        assert!(matches!(lost, LoopdError::OwnershipConflict { .. }));
        assert!(lost.is_transient());

        // Re-claiming by the same instance is idempotent
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "local-a", now + 1, THRESHOLD)
            .unwrap();
    }

    #[test]
    fn test_claim_owner_takes_over_expired_owner() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("stale", LoopConfig::shell("true")).unwrap();
        let now = now_ms();

        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "old", now - THRESHOLD - 1, THRESHOLD)
            .unwrap();
        let taken = store
            .loops()
            .claim_owner(&record.id, OwnerKind::Daemon, "new", now, THRESHOLD)
            .unwrap();
        assert_eq!(taken.owner_instance_id.as_deref(), Some("new"));
    }

    #[test]
    fn test_claim_over_dead_owner_fails_its_dispatched_items() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("handoff", LoopConfig::shell("true")).unwrap();
        let beat = now_ms() - THRESHOLD - 60_000;
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "dead-owner", beat, THRESHOLD)
            .unwrap();
        store.loops().mark_running(&record.id, "dead-owner", beat).unwrap();
        let old_pause = store
            .queue()
            .enqueue(&record.id, QueueItemType::Pause, &json!({}))
            .unwrap();
        store.queue().dequeue(&record.id).unwrap();

        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Daemon, "new-owner", now_ms(), THRESHOLD)
            .unwrap();
        let old_pause = store.queue().get(&old_pause.id).unwrap().unwrap();
        assert_eq!(old_pause.status, QueueItemStatus::Failed);

        // The new owner's own pause is the one a resume releases
        let new_pause = store
            .queue()
            .enqueue(&record.id, QueueItemType::Pause, &json!({}))
            .unwrap();
        store.queue().dequeue(&record.id).unwrap();
        let resumed = store.queue().resume(&record.id).unwrap().unwrap();
        assert_eq!(resumed.id, new_pause.id);
    }

    #[test]
    fn test_claim_by_same_owner_keeps_dispatched_items() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("again", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "me", now, THRESHOLD)
            .unwrap();
        let item = store
            .queue()
            .enqueue(&record.id, QueueItemType::Message, &json!({"text": "hi"}))
            .unwrap();
        store.queue().dequeue(&record.id).unwrap();

        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "me", now, THRESHOLD)
            .unwrap();
        assert_eq!(
            store.queue().get(&item.id).unwrap().unwrap().status,
            QueueItemStatus::Dispatched
        );
    }

    #[test]
    fn test_claim_owner_missing_loop() {
        let (store, _temp) = temp_store();
        let err = store
            .loops()
            .claim_owner("missing", OwnerKind::Local, "x", now_ms(), THRESHOLD)
            .unwrap_err();
        assert!(matches!(err, LoopdError::LoopNotFound(_)));
    }

    #[test]
    fn test_guarded_writes_fail_for_non_owner() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("guarded", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();

        assert!(matches!(
            store.loops().heartbeat(&record.id, "intruder", now),
            Err(LoopdError::OwnershipLost(_))
        ));
        assert!(matches!(
            store.loops().set_state(&record.id, "intruder", LoopState::Running, now),
            Err(LoopdError::OwnershipLost(_))
        ));
        store.loops().heartbeat(&record.id, "owner", now + 5).unwrap();
        assert_eq!(
            store.loops().require(&record.id).unwrap().last_heartbeat_at,
            Some(now + 5)
        );
    }

    #[test]
    fn test_record_iteration_appends_and_counts() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("iter", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();

        let result = IterationResult::from_command(
            &record.id,
            1,
            now,
            now + 10,
            &CommandResult::completed(0, "ok", ""),
            Decision::Continue,
            4096,
        );
        store.loops().record_iteration("owner", &result, now + 10).unwrap();

        let updated = store.loops().require(&record.id).unwrap();
        assert_eq!(updated.iteration_count, 1);
        assert_eq!(store.iterations().list(&record.id).unwrap(), vec![result.clone()]);

        // A non-owner writes nothing
        let second = IterationResult { sequence: 2, ..result };
        assert!(store.loops().record_iteration("intruder", &second, now + 20).is_err());
        assert_eq!(store.iterations().count(&record.id).unwrap(), 1);
    }

    #[test]
    fn test_release_owner_clears_fields() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("release", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();
        store.loops().mark_running(&record.id, "owner", now).unwrap();
        store
            .loops()
            .release_owner(&record.id, "owner", LoopState::Stopped, Some("rule-1: matched"), None, now)
            .unwrap();

        let updated = store.loops().require(&record.id).unwrap();
        assert_eq!(updated.state, LoopState::Stopped);
        assert_eq!(updated.stop_reason.as_deref(), Some("rule-1: matched"));
        assert!(updated.owner_instance_id.is_none());
        assert!(updated.owner_kind.is_none());
        assert!(updated.last_heartbeat_at.is_none());
    }

    #[test]
    fn test_set_replicas() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("scale", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();

        store.loops().set_replicas(&record.id, "owner", 4, now).unwrap();
        assert_eq!(store.loops().require(&record.id).unwrap().config.replicas, 4);
        assert!(store.loops().set_replicas(&record.id, "owner", 0, now).is_err());
        assert!(store.loops().set_replicas(&record.id, "other", 2, now).is_err());
    }

    #[test]
    fn test_reclaim_stale_fails_dispatched_items() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("dead", LoopConfig::shell("true")).unwrap();
        let beat = now_ms() - THRESHOLD - 60_000;
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "dead-owner", beat, THRESHOLD)
            .unwrap();
        store.loops().mark_running(&record.id, "dead-owner", beat).unwrap();

        let item = store
            .queue()
            .enqueue(&record.id, QueueItemType::Message, &json!({"text": "hi"}))
            .unwrap();
        store.queue().dequeue(&record.id).unwrap();

        let now = now_ms();
        let reclaimed = store
            .loops()
            .reclaim_stale(
                &record.id,
                Some("dead-owner"),
                now - THRESHOLD,
                LoopState::Stopped,
                "reclaimed",
                now,
            )
            .unwrap();
        assert!(reclaimed);

        let updated = store.loops().require(&record.id).unwrap();
        assert_eq!(updated.state, LoopState::Stopped);
        assert!(updated.owner_instance_id.is_none());

        let item = store.queue().get(&item.id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);

        // Second sweeper loses
        let again = store
            .loops()
            .reclaim_stale(
                &record.id,
                Some("dead-owner"),
                now - THRESHOLD,
                LoopState::Stopped,
                "reclaimed",
                now,
            )
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_reclaim_skips_fresh_heartbeat() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("alive", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();
        store.loops().mark_running(&record.id, "owner", now).unwrap();

        let reclaimed = store
            .loops()
            .reclaim_stale(&record.id, Some("owner"), now - THRESHOLD, LoopState::Stopped, "x", now)
            .unwrap();
        assert!(!reclaimed);
    }

    #[test]
    fn test_stop_unowned() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("idle", LoopConfig::shell("true")).unwrap();
        assert!(store.loops().stop_unowned(&record.id, "stopped by user", now_ms()).unwrap());
        assert_eq!(store.loops().require(&record.id).unwrap().state, LoopState::Stopped);
        assert!(matches!(
            store.loops().stop_unowned("missing", "x", now_ms()),
            Err(LoopdError::LoopNotFound(_))
        ));
    }

    #[test]
    fn test_remove_refuses_live_owner_and_cascades() {
        let (store, _temp) = temp_store();
        let record = store.loops().create("rm", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Local, "owner", now, THRESHOLD)
            .unwrap();
        store
            .queue()
            .enqueue(&record.id, QueueItemType::Stop, &json!({}))
            .unwrap();

        assert!(matches!(
            store.loops().remove(&record.id, now, THRESHOLD),
            Err(LoopdError::InvalidState(_))
        ));

        store
            .loops()
            .release_owner(&record.id, "owner", LoopState::Stopped, None, None, now)
            .unwrap();
        store.loops().remove(&record.id, now, THRESHOLD).unwrap();
        assert!(store.loops().get(&record.id).unwrap().is_none());
        assert!(store.queue().list(&record.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_active_and_owned() {
        let (store, _temp) = temp_store();
        let a = store.loops().create("a", LoopConfig::shell("true")).unwrap();
        store.loops().create("b", LoopConfig::shell("true")).unwrap();
        let now = now_ms();
        store
            .loops()
            .claim_owner(&a.id, OwnerKind::Daemon, "daemon-1", now, THRESHOLD)
            .unwrap();
        store.loops().mark_running(&a.id, "daemon-1", now).unwrap();

        let active = store.loops().list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
        assert_eq!(store.loops().list_owned_by("daemon-1").unwrap().len(), 1);
        assert_eq!(store.loops().list_by_state(LoopState::Idle).unwrap().len(), 1);
    }
}
