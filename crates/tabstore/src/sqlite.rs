//! SQLite object store using rusqlite.
//!
//! One database file can be opened by several processes at once; every
//! [`ObjectStore::transaction`] starts with `BEGIN IMMEDIATE`, so concurrent
//! writers queue on SQLite's write lock and the revision check inside the
//! sync flush is a true compare-and-swap.
//!
//! # Example
//!
//! ```no_run
//! use tabstore::{ObjectStore, SqliteObjectStore, Txn};
//!
//! let store = SqliteObjectStore::open("tabs.db").unwrap();
//! store.transaction(|txn| txn.put("app:theme", "dark")).unwrap();
//!
//! let all = store.read_all().unwrap();
//! assert_eq!(all.get("app:theme").map(String::as_str), Some("dark"));
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Deserialize;

use crate::error::BackendError;
use crate::traits::{ObjectStore, Txn};

/// SQLite configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-Ahead Logging. Readers don't block the writer.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Shared [`ObjectStore`] backed by a single `kv` table.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex`. Each handle is one
/// process's connection; open the same path again for another process.
pub struct SqliteObjectStore {
    conn: Mutex<Connection>,
}

impl SqliteObjectStore {
    /// Open (or create) a database at `path` with the default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BackendError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, &SqliteConfig::default())?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), BackendError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), BackendError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key     TEXT PRIMARY KEY NOT NULL,
                value   TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn.lock().map_err(|_| BackendError::LockPoisoned)
    }
}

struct SqliteTxn<'a> {
    conn: &'a Connection,
}

impl Txn for SqliteTxn<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, BackendError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), BackendError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), BackendError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl ObjectStore for SqliteObjectStore {
    fn read_all(&self) -> Result<BTreeMap<String, String>, BackendError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let all = rows.collect::<Result<BTreeMap<String, String>, _>>()?;
        Ok(all)
    }

    fn transaction<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<R, BackendError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&mut SqliteTxn { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "sqlite rollback failed");
                }
                Err(e)
            }
        }
    }
}
