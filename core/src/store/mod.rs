//! SQLite persistence layer, the reference collaborator implementation.
//!
//! RULE: Only the store talks to the database.
//! Engines reach it through the collaborator traits; they never execute SQL.
//!
//! The connection sits behind a mutex so one store can serve every worker
//! thread. Each trait method holds the lock for exactly one statement or
//! one transaction.

use crate::{
    error::{EngineError, EngineResult},
    types::Timestamp,
};
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

mod audit;
mod bandit;
mod grading;
mod variance;

pub struct EngineStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl EngineStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Open and migrate an in-memory database in one step.
    pub fn in_memory_migrated() -> EngineResult<Self> {
        let store = Self::in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_donors.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_experiments.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/004_variance.sql"))?;
        Ok(())
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::LockPoisoned("store connection"))
    }
}

fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> EngineResult<Timestamp> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::invalid_input("timestamp", format!("{ms} ms is out of range")))
}
