//! Single-document async KV over the `kv` table.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON documents keyed by string. Every operation rejects on backend
/// error; callers retry or degrade.
#[derive(Clone)]
pub struct KvStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl KvStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }
}
