//! The meta-database: a small key-value store over sqlite.
//!
//! The IOV provider records collection compositions here; the ctl database
//! utilities read and edit the same file.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
#[error("meta-database: {0}")]
pub struct DbError(#[from] rusqlite::Error);

/// One sqlite file holding `key -> value` entries.
pub struct MetaDb {
    conn: Mutex<Connection>,
}

impl MetaDb {
    pub fn open(path: &Path) -> Result<MetaDb, DbError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<MetaDb, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<MetaDb, DbError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(MetaDb {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or overwrite.
    pub fn set(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO entries (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM entries WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Delete an entry, returning the old value if there was one.
    pub fn remove(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let old: Option<String> = conn
            .query_row("SELECT value FROM entries WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        if old.is_some() {
            conn.execute("DELETE FROM entries WHERE key = ?1", [key])?;
        }
        Ok(old)
    }

    /// All entries in key order.
    pub fn entries(&self) -> Result<Vec<(String, String)>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare("SELECT key, value FROM entries ORDER BY key")?;
        let rows = statement
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
