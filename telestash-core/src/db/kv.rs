//! Key-value repository
//!
//! Stores opaque string blobs by key. Every write is its own SQLite
//! transaction, so a blob is either fully replaced or left as it was when the
//! process dies mid-write.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Raw persistence primitive consumed by the queue and identity layers.
pub trait KeyValueStore: Send + Sync {
    /// Read the blob stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the blob stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key` if present
    fn remove(&self, key: &str) -> Result<()>;

    /// Replace several blobs in one atomic write
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()>;

    /// Delete every key
    fn clear(&self) -> Result<()>;
}

/// Summary of one stored key, for status output.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    /// Key name
    pub key: String,
    /// Blob length in bytes
    pub size_bytes: usize,
    /// Last write time, if known
    pub updated_at: Option<DateTime<Utc>>,
}

/// SQLite-backed key-value store (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a store at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer; FULL sync makes each commit durable
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store with migrations applied (for testing)
    pub fn open_in_memory_migrated() -> Result<Self> {
        let db = Self::open_in_memory()?;
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave a half-written blob
        // behind (writes are transactional), so a poisoned lock is usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// List stored keys with their sizes
    pub fn keys(&self) -> Result<Vec<KeyInfo>> {
        let conn = self.connection();
        let mut stmt =
            conn.prepare("SELECT key, length(CAST(value AS BLOB)), updated_at FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            let updated_at: Option<String> = row.get(2)?;
            Ok(KeyInfo {
                key: row.get(0)?,
                size_bytes: row.get::<_, i64>(1)? as usize,
                updated_at: updated_at
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            })
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (key, value) in entries {
            tx.execute(
                r#"
                INSERT INTO kv (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.connection();
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}
