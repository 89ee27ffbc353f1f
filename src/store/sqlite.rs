//! SQLite-backed item store.
//!
//! One database file per node. The journal runs in WAL mode so readers
//! proceed against a consistent snapshot while a writer holds the single
//! write lock; writer transactions take the lock up front with
//! `BEGIN IMMEDIATE`, which is what makes `claim_next` serialisable against
//! concurrent claimers. Contended connections wait up to `BUSY_TIMEOUT_MS`
//! before surfacing `SQLITE_BUSY` (the transient error class).

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::model::{now_ms, Item, JobOutcome, ProcState};

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item with extern_id already exists")]
    Duplicate,
    #[error("item not found")]
    NotFound,
    #[error("job not owned by this node")]
    NotOwned,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether a retry by the caller is reasonable (write contention,
    /// I/O-level failures). Logical errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: path.as_ref().to_path_buf(),
        };
        let conn = store.conn()?;
        initialize_schema(&conn)?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(conn)
    }

    /// Inserts a new pending item. `extern_id` must be cluster-unique.
    pub fn create(&self, extern_id: &str, payload: &str) -> Result<Item, StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO items (extern_id, payload, done, created_at) VALUES (?1, ?2, 0, ?3)",
            params![extern_id, payload, now_ms()],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                get_by_local_id(&conn, id)?.ok_or(StoreError::NotFound)
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_by_local_id(&self, id: i64) -> Result<Option<Item>, StoreError> {
        let conn = self.conn()?;
        get_by_local_id(&conn, id)
    }

    pub fn get_by_extern_id(&self, extern_id: &str) -> Result<Option<Item>, StoreError> {
        let conn = self.conn()?;
        get_by_extern_id(&conn, extern_id)
    }

    /// All items, newest first.
    pub fn list(&self) -> Result<Vec<Item>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Updates payload and/or done. Never touches the processing columns.
    pub fn update_payload(
        &self,
        local_id: i64,
        payload: Option<&str>,
        done: Option<bool>,
    ) -> Result<Item, StoreError> {
        let conn = self.conn()?;
        let affected = match (payload, done) {
            (Some(p), Some(d)) => conn.execute(
                "UPDATE items SET payload = ?1, done = ?2 WHERE id = ?3",
                params![p, d, local_id],
            )?,
            (Some(p), None) => conn.execute(
                "UPDATE items SET payload = ?1 WHERE id = ?2",
                params![p, local_id],
            )?,
            (None, Some(d)) => conn.execute(
                "UPDATE items SET done = ?1 WHERE id = ?2",
                params![d, local_id],
            )?,
            (None, None) => {
                return get_by_local_id(&conn, local_id)?.ok_or(StoreError::NotFound);
            }
        };
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        get_by_local_id(&conn, local_id)?.ok_or(StoreError::NotFound)
    }

    pub fn delete(&self, local_id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM items WHERE id = ?1", params![local_id])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_by_proc_state(&self, state: ProcState) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE proc_state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Atomically claims the oldest pending item for `node_name`.
    ///
    /// Returns `None` when nothing is pending or another claimer won the
    /// race. The transaction holds the write lock from the start, so two
    /// concurrent callers can never observe the same row as claimable.
    pub fn claim_next(&self, node_name: &str) -> Result<Option<Item>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM items
                 WHERE proc_state = 'pending' AND done = 0
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        let now = now_ms();
        let affected = tx.execute(
            "UPDATE items
             SET proc_state = 'claimed', claimer = ?1, claimed_at = ?2, last_heartbeat = ?2
             WHERE id = ?3 AND proc_state = 'pending'",
            params![node_name, now, id],
        )?;
        if affected == 0 {
            // Lost the race to another claimer.
            return Ok(None);
        }

        let item = get_by_local_id(&tx, id)?.ok_or(StoreError::NotFound)?;
        tx.commit()?;
        Ok(Some(item))
    }

    /// Advances a claimed item to processing. No-op when the row already
    /// moved past `claimed` (e.g. swept and re-dispatched elsewhere).
    pub fn mark_processing(&self, extern_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE items
             SET proc_state = 'processing', started_at = ?1
             WHERE extern_id = ?2 AND proc_state = 'claimed'",
            params![now_ms(), extern_id],
        )?;
        Ok(())
    }

    /// Refreshes the claim heartbeat; fails with `NotOwned` when the row is
    /// no longer held by `node_name`.
    pub fn heartbeat(&self, extern_id: &str, node_name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE items
             SET last_heartbeat = ?1
             WHERE extern_id = ?2 AND claimer = ?3
               AND proc_state IN ('claimed', 'processing')",
            params![now_ms(), extern_id, node_name],
        )?;
        if affected == 0 {
            return Err(StoreError::NotOwned);
        }
        Ok(())
    }

    /// Moves an item into a terminal state and drops the claim columns in
    /// the same statement so the claim/state coupling holds per commit.
    pub fn finalise(&self, extern_id: &str, outcome: JobOutcome) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE items
             SET proc_state = ?1, finished_at = ?2,
                 claimer = NULL, claimed_at = NULL, last_heartbeat = NULL
             WHERE extern_id = ?3",
            params![outcome.proc_state().as_str(), now_ms(), extern_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Unconditionally returns an item to the pending pool.
    pub fn release(&self, extern_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let affected = conn.execute(
            "UPDATE items
             SET proc_state = 'pending', claimer = NULL, claimed_at = NULL,
                 last_heartbeat = NULL, started_at = NULL, finished_at = NULL
             WHERE extern_id = ?1",
            params![extern_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Claimed or processing items whose heartbeat is strictly older than
    /// `timeout`.
    pub fn stale_claims(&self, timeout: Duration) -> Result<Vec<Item>, StoreError> {
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE proc_state IN ('claimed', 'processing') AND last_heartbeat < ?1"
        ))?;
        let rows = stmt.query_map(params![cutoff], item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Items currently claimed by the given node.
    pub fn claims_of(&self, node_name: &str) -> Result<Vec<Item>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE claimer = ?1 AND proc_state IN ('claimed', 'processing')"
        ))?;
        let rows = stmt.query_map(params![node_name], item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

const ITEM_COLUMNS: &str = "id, extern_id, payload, done, created_at, proc_state, \
                            claimer, claimed_at, last_heartbeat, started_at, finished_at";

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS items (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           extern_id TEXT NOT NULL,
           payload TEXT NOT NULL,
           done INTEGER NOT NULL DEFAULT 0,
           created_at INTEGER NOT NULL,
           proc_state TEXT NOT NULL DEFAULT 'pending',
           claimer TEXT,
           claimed_at INTEGER,
           last_heartbeat INTEGER,
           started_at INTEGER,
           finished_at INTEGER
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_items_extern_id ON items (extern_id);
         CREATE INDEX IF NOT EXISTS idx_items_created_at ON items (created_at);
         CREATE INDEX IF NOT EXISTS idx_items_done ON items (done);
         CREATE INDEX IF NOT EXISTS idx_items_proc_state ON items (proc_state);
         CREATE INDEX IF NOT EXISTS idx_items_claimer ON items (claimer);
         CREATE INDEX IF NOT EXISTS idx_items_last_heartbeat ON items (last_heartbeat);",
    )?;
    Ok(())
}

fn get_by_local_id(conn: &Connection, id: i64) -> Result<Option<Item>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
            params![id],
            item_from_row,
        )
        .optional()?;
    Ok(row)
}

fn get_by_extern_id(conn: &Connection, extern_id: &str) -> Result<Option<Item>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE extern_id = ?1"),
            params![extern_id],
            item_from_row,
        )
        .optional()?;
    Ok(row)
}

fn item_from_row(row: &rusqlite::Row<'_>) -> Result<Item, rusqlite::Error> {
    let state_raw: String = row.get(5)?;
    let proc_state = ProcState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown proc_state {state_raw:?}").into(),
        )
    })?;
    Ok(Item {
        local_id: row.get(0)?,
        extern_id: row.get(1)?,
        payload: row.get(2)?,
        done: row.get(3)?,
        created_at: row.get(4)?,
        proc_state,
        claimer: row.get(6)?,
        claimed_at: row.get(7)?,
        last_heartbeat: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}
