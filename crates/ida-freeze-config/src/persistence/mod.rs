//! DuckDB implementation of the record stores.
//!
//! A single connection is shared behind a mutex; compound writes run in one
//! transaction while the mutex is held.

mod actions;
mod changes;
mod files;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use duckdb::Connection;

use crate::store::{StoreError, StoreResult};
use crate::types::{format_timestamp, parse_timestamp};

/// Database path that selects an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Handle to the workflow database.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
    location: Option<PathBuf>,
}

impl Persistence {
    /// Open (and create if needed) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path == Path::new(IN_MEMORY) {
            return Ok(Self::in_memory()?);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        let persistence = Self {
            conn: Arc::new(Mutex::new(conn)),
            location: Some(path.to_path_buf()),
        };
        persistence
            .initialize()
            .with_context(|| format!("failed to initialize schema in {}", path.display()))?;

        tracing::info!("Opened workflow database at {}", path.display());
        Ok(persistence)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let persistence = Self {
            conn: Arc::new(Mutex::new(conn)),
            location: None,
        };
        persistence.initialize()?;
        Ok(persistence)
    }

    /// Database file, `None` for in-memory databases.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Flush the write-ahead log into the database file.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.conn()?.execute_batch("CHECKPOINT")?;
        Ok(())
    }

    fn initialize(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal(anyhow!("database connection mutex poisoned")))
    }
}

pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    format_timestamp(value)
}

pub(crate) fn opt_ts(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.as_ref().map(format_timestamp)
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose().map_err(Into::into)
}

pub(crate) fn next_id(conn: &Connection, sequence: &str) -> StoreResult<i64> {
    let sql = format!("SELECT nextval('{sequence}')");
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ida.duckdb");

        let persistence = Persistence::new(&path).unwrap();
        assert_eq!(persistence.location(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ida.duckdb");

        {
            let persistence = Persistence::new(&path).unwrap();
            persistence.checkpoint().unwrap();
        }
        Persistence::new(&path).unwrap();
    }

    #[test]
    fn test_memory_path() {
        let persistence = Persistence::new(IN_MEMORY).unwrap();
        assert!(persistence.location().is_none());
    }
}
