//! Task persistence with version-based optimistic locking.
//!
//! The task table is the sole cross-process authority: every state
//! transition is a compare-and-set on the `version` column, and a lost race
//! surfaces as [`StoreError::Contention`] so callers can back off silently.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, warn};

use optroll_broker::ExchangeError;
use optroll_core::{Quantity, Side, Task, TaskId, TaskState};

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by task repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The optimistic lock was lost: another writer advanced the row first.
    #[error("task {0} was modified concurrently")]
    Contention(TaskId),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt row for task {id}: {detail}")]
    Corrupt { id: TaskId, detail: String },
}

/// Persistent repository for watch tasks.
///
/// `update_state` and `update_symbol` succeed only when the caller's observed
/// version matches the row; both increment `version` and refresh
/// `updated_at`. `register_error` is the terminal disposition of an already
/// committed attempt and therefore skips the version check.
pub trait TaskStore: Send + Sync {
    /// Insert a new task; assigns `id` and forces `version = 1`.
    fn create(&self, task: &mut Task) -> StoreResult<()>;

    fn get(&self, id: TaskId) -> StoreResult<Task>;

    /// Tasks whose status is not terminal.
    fn list_active(&self) -> StoreResult<Vec<Task>>;

    fn update_state(
        &self,
        id: TaskId,
        new_status: TaskState,
        observed_version: i64,
    ) -> StoreResult<()>;

    /// Atomically swap symbol + quantity and reset status to `IDLE`.
    fn update_symbol(
        &self,
        id: TaskId,
        new_symbol: &str,
        new_qty: Quantity,
        observed_version: i64,
    ) -> StoreResult<()>;

    /// Classify `err` and dispose of the attempt: transient errors rewind the
    /// task to `IDLE` for the next tick, fatal ones park it in `FAILED`.
    /// Returns the state that was written.
    fn register_error(&self, id: TaskId, err: &ExchangeError) -> StoreResult<TaskState>;
}

const ACTIVE_STATES: &str = "('IDLE', 'ROLL_INITIATED', 'LEG1_CLOSED')";

const TASK_COLUMNS: &str = "id, owner_id, credential_id, current_option_symbol, \
     underlying_symbol, target_side, current_qty, trigger_price, next_strike_step, \
     status, version, last_error, created_at, updated_at";

/// SQLite-backed implementation of [`TaskStore`].
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database, mainly for tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                credential_id INTEGER NOT NULL,
                current_option_symbol TEXT NOT NULL,
                underlying_symbol TEXT NOT NULL,
                target_side TEXT,
                current_qty TEXT NOT NULL,
                trigger_price TEXT NOT NULL,
                next_strike_step TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_underlying ON tasks(underlying_symbol);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, task: &mut Task) -> StoreResult<()> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tasks (
                owner_id, credential_id, current_option_symbol, underlying_symbol,
                target_side, current_qty, trigger_price, next_strike_step,
                status, version, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, NULL, ?10, ?10)
            "#,
            params![
                task.owner_id,
                task.credential_id,
                task.current_option_symbol,
                task.underlying_symbol,
                task.target_side.map(Side::as_str),
                task.current_qty.to_string(),
                task.trigger_price.to_string(),
                task.next_strike_step.to_string(),
                task.status.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        task.id = conn.last_insert_rowid();
        task.version = 1;
        task.created_at = now;
        task.updated_at = now;
        Ok(())
    }

    fn get(&self, id: TaskId) -> StoreResult<Task> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => scan_task(row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn list_active(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN {ACTIVE_STATES} ORDER BY id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(scan_task(row)?);
        }
        Ok(tasks)
    }

    fn update_state(
        &self,
        id: TaskId,
        new_status: TaskState,
        observed_version: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET status = ?1, version = version + 1, updated_at = ?2
            WHERE id = ?3 AND version = ?4
            "#,
            params![
                new_status.as_str(),
                Utc::now().to_rfc3339(),
                id,
                observed_version
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Contention(id));
        }
        Ok(())
    }

    fn update_symbol(
        &self,
        id: TaskId,
        new_symbol: &str,
        new_qty: Quantity,
        observed_version: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET current_option_symbol = ?1, current_qty = ?2, status = 'IDLE',
                version = version + 1, updated_at = ?3
            WHERE id = ?4 AND version = ?5
            "#,
            params![
                new_symbol,
                new_qty.to_string(),
                Utc::now().to_rfc3339(),
                id,
                observed_version
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Contention(id));
        }
        Ok(())
    }

    fn register_error(&self, id: TaskId, err: &ExchangeError) -> StoreResult<TaskState> {
        let message = err.to_string();
        let new_state = if err.is_transient() {
            warn!(task_id = id, error = %message, "transient error registered, scheduling retry");
            TaskState::Idle
        } else {
            error!(task_id = id, error = %message, "fatal error registered, task failed");
            TaskState::Failed
        };
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET last_error = ?1, status = ?2, version = version + 1, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                message,
                new_state.as_str(),
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(new_state)
    }
}

fn scan_task(row: &Row<'_>) -> StoreResult<Task> {
    let id: TaskId = row.get(0)?;
    let target_side: Option<String> = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(Task {
        id,
        owner_id: row.get(1)?,
        credential_id: row.get(2)?,
        current_option_symbol: row.get(3)?,
        underlying_symbol: row.get(4)?,
        target_side: match target_side {
            Some(side) => Some(Side::from_exchange(&side).ok_or_else(|| StoreError::Corrupt {
                id,
                detail: format!("unknown side '{side}'"),
            })?),
            None => None,
        },
        current_qty: scan_decimal(id, row, 6)?,
        trigger_price: scan_decimal(id, row, 7)?,
        next_strike_step: scan_decimal(id, row, 8)?,
        status: TaskState::parse(&status).ok_or_else(|| StoreError::Corrupt {
            id,
            detail: format!("unknown status '{status}'"),
        })?,
        version: row.get(10)?,
        last_error: row.get(11)?,
        created_at: scan_timestamp(id, row, 12)?,
        updated_at: scan_timestamp(id, row, 13)?,
    })
}

fn scan_decimal(id: TaskId, row: &Row<'_>, index: usize) -> StoreResult<Decimal> {
    let raw: String = row.get(index)?;
    Decimal::from_str(&raw).map_err(|err| StoreError::Corrupt {
        id,
        detail: format!("bad decimal '{raw}': {err}"),
    })
}

fn scan_timestamp(id: TaskId, row: &Row<'_>, index: usize) -> StoreResult<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt {
            id,
            detail: format!("bad timestamp '{raw}': {err}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_task() -> Task {
        Task {
            id: 0,
            owner_id: 11,
            credential_id: 3,
            current_option_symbol: "BTC-26DEC25-100000-C".into(),
            underlying_symbol: "BTCUSDT".into(),
            target_side: Some(Side::Sell),
            current_qty: dec!(0.1),
            trigger_price: dec!(100000),
            next_strike_step: dec!(1000),
            status: TaskState::Idle,
            version: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_assigns_id_and_initial_version() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();
        assert!(task.id > 0);
        assert_eq!(task.version, 1);

        let loaded = store.get(task.id).unwrap();
        assert_eq!(loaded.status, TaskState::Idle);
        assert_eq!(loaded.target_side, Some(Side::Sell));
    }

    #[test]
    fn decimal_fields_round_trip_exactly() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        task.current_qty = dec!(0.00000001);
        task.trigger_price = dec!(98765.4321);
        store.create(&mut task).unwrap();

        let loaded = store.get(task.id).unwrap();
        assert_eq!(loaded.current_qty, dec!(0.00000001));
        assert_eq!(loaded.trigger_price, dec!(98765.4321));
    }

    #[test]
    fn update_state_enforces_optimistic_lock() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();

        store
            .update_state(task.id, TaskState::RollInitiated, 1)
            .unwrap();
        // Same observed version loses the race.
        let err = store
            .update_state(task.id, TaskState::RollInitiated, 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));

        let loaded = store.get(task.id).unwrap();
        assert_eq!(loaded.status, TaskState::RollInitiated);
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn update_symbol_swaps_and_resets_to_idle() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();
        store
            .update_state(task.id, TaskState::RollInitiated, 1)
            .unwrap();
        store.update_state(task.id, TaskState::Leg1Closed, 2).unwrap();

        store
            .update_symbol(task.id, "BTC-26DEC25-101000-C", dec!(0.1), 3)
            .unwrap();
        let loaded = store.get(task.id).unwrap();
        assert_eq!(loaded.current_option_symbol, "BTC-26DEC25-101000-C");
        assert_eq!(loaded.status, TaskState::Idle);
        assert_eq!(loaded.version, 4);
    }

    #[test]
    fn register_error_rewinds_transient_to_idle() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();
        store
            .update_state(task.id, TaskState::RollInitiated, 1)
            .unwrap();

        let state = store
            .register_error(task.id, &ExchangeError::Exchange("deadline exceeded".into()))
            .unwrap();
        assert_eq!(state, TaskState::Idle);

        let loaded = store.get(task.id).unwrap();
        assert_eq!(loaded.status, TaskState::Idle);
        assert_eq!(loaded.version, 3);
        assert!(loaded.last_error.unwrap().contains("deadline exceeded"));
    }

    #[test]
    fn register_error_marks_fatal_as_failed() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();

        let state = store
            .register_error(
                task.id,
                &ExchangeError::Exchange("insufficient margin".into()),
            )
            .unwrap();
        assert_eq!(state, TaskState::Failed);
        assert_eq!(store.get(task.id).unwrap().status, TaskState::Failed);
        // Failed tasks leave active circulation.
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn list_active_skips_terminal_states() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut idle = new_task();
        store.create(&mut idle).unwrap();
        let mut closed = new_task();
        store.create(&mut closed).unwrap();
        store
            .update_state(closed.id, TaskState::RollInitiated, 1)
            .unwrap();
        store
            .update_state(closed.id, TaskState::Leg1Closed, 2)
            .unwrap();
        let mut done = new_task();
        store.create(&mut done).unwrap();
        store.update_state(done.id, TaskState::Completed, 1).unwrap();

        let active = store.list_active().unwrap();
        let ids: Vec<TaskId> = active.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![idle.id, closed.id]);
    }

    #[test]
    fn versions_only_move_forward() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut task = new_task();
        store.create(&mut task).unwrap();
        let mut last = store.get(task.id).unwrap().version;
        store
            .update_state(task.id, TaskState::RollInitiated, last)
            .unwrap();
        for _ in 0..3 {
            let current = store.get(task.id).unwrap().version;
            assert!(current > last);
            last = current;
            store
                .register_error(task.id, &ExchangeError::Transport("reset".into()))
                .unwrap();
        }
    }
}
