//! Persistence port for exam progress and multi-instance heartbeats.
//!
//! The kernel is storage-agnostic: it reads and writes opaque string values
//! under string keys. `InMemoryProgressStore` backs tests; the SQLite store
//! backs hosts that need progress to survive a reload.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared key for multi-instance heartbeats.
pub const INSTANCES_KEY: &str = "exam_instances";

pub fn progress_key(exam_id: &str) -> String {
    format!("exam_progress_{}", exam_id)
}

pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

pub type SharedProgressStore = Arc<dyn ProgressStore>;

#[derive(Default)]
pub struct InMemoryProgressStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedProgressStore {
        Arc::new(Self::new())
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

pub struct SqliteProgressStore {
    conn: Mutex<Connection>,
}

impl SqliteProgressStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS exam_progress (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("progress store connection lock poisoned"))
    }
}

impl ProgressStore for SqliteProgressStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM exam_progress WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let updated_at = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO exam_progress(key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, updated_at],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM exam_progress WHERE key = ?1", params![key])?;
        Ok(())
    }
}
