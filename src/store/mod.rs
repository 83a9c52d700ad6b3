//! # Stage: Embedded Store
//!
//! ## Responsibility
//! Owns the SQLite connection that backs the event ledger and the experiment
//! registry: opening, WAL setup, ordered schema migrations, and the small
//! key/value settings table.
//!
//! ## Guarantees
//! - Every statement runs under a short-lived connection lock; no lock is held
//!   across two storage calls, so races are settled by SQLite constraints
//! - Concurrent workers get independent connections via [`SqliteStore::reopen`]
//! - Schema version tracked with `PRAGMA user_version`
//!
//! ## NOT Responsible For
//! - Retrying failed writes (caller's concern)
//! - Existence checks before ledger writes (gateway's concern)

pub mod ledger;
pub mod registry;

pub use ledger::EventLedger;
pub use registry::ExperimentRegistry;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::Result;

/// Highest schema version this build knows how to create.
pub const SCHEMA_VERSION: i64 = 2;

const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT    NOT NULL UNIQUE,
    variants            TEXT    NOT NULL,
    weights             TEXT,
    goal                TEXT,
    state               TEXT    NOT NULL DEFAULT 'running',
    winner_variant      INTEGER,
    source              TEXT    NOT NULL DEFAULT 'client',
    has_source_conflict INTEGER NOT NULL DEFAULT 0,
    url                 TEXT,
    target              TEXT,
    cta_target          TEXT,
    conversion_url      TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiments_state ON experiments(state);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment  TEXT    NOT NULL,
    variant     INTEGER NOT NULL,
    kind        TEXT    NOT NULL CHECK (kind IN ('view', 'convert')),
    visitor_id  TEXT    NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedup ON events(experiment, visitor_id, kind);
CREATE INDEX IF NOT EXISTS idx_events_experiment ON events(experiment, variant);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MIGRATION_V2: &str = "
CREATE INDEX IF NOT EXISTS idx_experiments_url ON experiments(url);
";

/// Connection tuning applied at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// SQLite-backed implementation of [`EventLedger`] and [`ExperimentRegistry`].
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    options: StoreOptions,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        migrate(&mut conn)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            options: options.clone(),
        })
    }

    /// Private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            options: StoreOptions::default(),
        })
    }

    /// A new, independent connection to the same database file.
    ///
    /// In-memory stores cannot be shared this way and return
    /// `StorageUnavailable`.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path, &self.options),
            None => Err(rusqlite::Error::InvalidPath(PathBuf::from(":memory:")).into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another caller panicked mid-statement;
        // SQLite rolled that statement back, so the connection is still usable.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Upsert a key/value setting.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn count_experiments(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM experiments", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current < 1 {
        tx.execute_batch(MIGRATION_V1)?;
        current = 1;
    }
    if current < 2 {
        tx.execute_batch(MIGRATION_V2)?;
        current = 2;
    }

    tx.pragma_update(None, "user_version", current)?;
    tx.commit()?;
    Ok(())
}
