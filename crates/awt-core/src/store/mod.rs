//! Durable storage: pooled SQLite backend with a graph collection set,
//! a single-document KV surface, and the conversation and job stores.

pub mod conversation_store;
pub mod graph_store;
pub mod job_store;
pub mod kv;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub use conversation_store::{ConversationStore, MetaPatch, SearchFilters, SearchQuery, SearchSort};
pub use graph_store::{GraphStore, ScheduledSaver};
pub use job_store::JobStore;
pub use kv::KvStore;
pub use schema::{Conversation, ConversationIndex, ConversationMessage, StoreStats};

/// The storage facade: one connection pool shared by every sub-store.
pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    pub graph: GraphStore,
    pub conversations: ConversationStore,
    pub jobs: JobStore,
    pub kv: KvStore,
}

impl MemoryStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        info!("Store initialized");
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database; a single pooled connection so every
    /// sub-store sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        let kv = KvStore::new(Arc::clone(&pool));
        Self {
            graph: GraphStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(kv.clone()),
            jobs: JobStore::new(kv.clone()),
            kv,
            pool,
        }
    }

    pub async fn stats(&self) -> anyhow::Result<StoreStats> {
        let (nodes, edges, sessions) = {
            let conn = self.pool.get()?;
            let count = |table: &str| -> anyhow::Result<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?)
            };
            (count("nodes")?, count("edges")?, count("sessions")?)
        };

        Ok(StoreStats {
            nodes,
            edges,
            sessions,
            conversations: self.conversations.count().await?,
            jobs: self.jobs.count().await?,
        })
    }
}
