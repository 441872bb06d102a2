//! Storage layer for loopd.
//!
//! A single SQLite database holds loop records, queue items and iteration
//! history. Several processes (CLI invocations and a daemon) may open the
//! same file; cross-process exclusivity comes from conditional `UPDATE`
//! statements and `BEGIN IMMEDIATE` transactions, never from in-memory locks.
//!
//! # Example
//!
//! ```ignore
//! use loopd::store::Store;
//! use loopd::domain::LoopConfig;
//!
//! let store = Store::open_at(Path::new("/tmp/loopd.db"))?;
//! let record = store.loops().create("docs", LoopConfig::shell("./agent.sh"))?;
//! store.queue().enqueue(&record.id, QueueItemType::Message, &json!({"text": "hello"}))?;
//! ```

mod iterations;
mod loops;
mod queue;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use rusqlite::Connection;

use crate::error::{LoopdError, Result};

pub use iterations::IterationRepository;
pub use loops::LoopRepository;
pub use queue::QueueRepository;

/// Reason recorded on queue items abandoned by a dead owner.
pub const ABANDONED_ITEM_ERROR: &str = "owner presumed dead";

/// How long a writer waits for another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the loopd database.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;

        debug!("Opened store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn loops(&self) -> LoopRepository<'_> {
        LoopRepository::new(self)
    }

    pub fn queue(&self) -> QueueRepository<'_> {
        QueueRepository::new(self)
    }

    pub fn iterations(&self) -> IterationRepository<'_> {
        IterationRepository::new(self)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LoopdError::Storage("connection mutex poisoned".into()))
    }
}

/// Default database location: `<data_local_dir>/loopd/loopd.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loopd")
        .join("loopd.db")
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS loops (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            short_id TEXT NOT NULL,
            config TEXT NOT NULL,
            state TEXT NOT NULL,
            iteration_count INTEGER NOT NULL DEFAULT 0,
            stop_reason TEXT,
            last_error TEXT,
            owner_kind TEXT,
            owner_instance_id TEXT,
            last_heartbeat_at INTEGER,
            started_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_loops_state ON loops(state);

        CREATE TABLE IF NOT EXISTS queue_items (
            id TEXT PRIMARY KEY,
            loop_id TEXT NOT NULL REFERENCES loops(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            item_type TEXT NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            completed_at INTEGER,
            error TEXT,
            UNIQUE (loop_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_queue_loop_status ON queue_items(loop_id, status, position);

        CREATE TABLE IF NOT EXISTS iterations (
            loop_id TEXT NOT NULL REFERENCES loops(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            exit_code INTEGER NOT NULL,
            timed_out INTEGER NOT NULL,
            stdout_tail TEXT NOT NULL,
            stderr_tail TEXT NOT NULL,
            decision TEXT NOT NULL,
            queue_item_id TEXT,
            error TEXT,
            PRIMARY KEY (loop_id, sequence)
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn temp_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::open_at(&temp_dir.path().join("loopd.db")).unwrap();
        (store, temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("loopd.db");
        let store = Store::open_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("loopd.db");
        {
            let store = Store::open_at(&path).unwrap();
            store
                .loops()
                .create("persisted", crate::domain::LoopConfig::shell("true"))
                .unwrap();
        }
        let store = Store::open_at(&path).unwrap();
        let all = store.loops().list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "persisted");
    }

    #[test]
    fn test_default_db_path_ends_with_loopd_db() {
        let path = default_db_path();
        assert!(path.ends_with("loopd/loopd.db"));
    }
}
