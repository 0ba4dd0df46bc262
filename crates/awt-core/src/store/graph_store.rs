//! Indexed persistence for the memory graph.
//!
//! Records are stored as full JSON in `data` with the filterable columns
//! mirrored out for index scans. `save_graph` rewrites all live records in
//! one transaction; `load_graph` reads the three collections back and the
//! in-memory indices are rebuilt by [`crate::graph::MemoryGraph::restore`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::graph::{Edge, GraphSnapshot, GraphStats, MemoryGraph, Node, Session};

const META_STATS: &str = "stats";
const META_LAST_SAVED: &str = "lastSaved";
const COMPACT_MIN_AGE_DAYS: i64 = 7;

#[derive(Clone)]
pub struct GraphStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl GraphStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    // ===== Per-record operations =====

    pub async fn put_node(&self, node: &Node) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO nodes
             (id, node_type, platform, session_id, created_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.id,
                node.node_type.as_str(),
                node.platform,
                node.session_id,
                node.metadata.created_at.to_rfc3339(),
                node.metadata.updated_at.to_rfc3339(),
                serde_json::to_string(node)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> anyhow::Result<Option<Node>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT data FROM nodes WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_node(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        Ok(conn.execute("DELETE FROM nodes WHERE id = ?1", [id])? > 0)
    }

    pub async fn get_all_nodes(&self) -> anyhow::Result<Vec<Node>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT data FROM nodes")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut nodes = Vec::new();
        for raw in rows {
            nodes.push(serde_json::from_str(&raw?)?);
        }
        Ok(nodes)
    }

    /// Nodes with `created_at >= cutoff`, newest first (reversed cursor).
    pub async fn nodes_created_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<Node>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT data FROM nodes WHERE created_at >= ?1 ORDER BY created_at DESC")?;
        let rows = stmt.query_map([cutoff.to_rfc3339()], |row| row.get::<_, String>(0))?;
        let mut nodes = Vec::new();
        for raw in rows {
            nodes.push(serde_json::from_str(&raw?)?);
        }
        Ok(nodes)
    }

    pub async fn put_edge(&self, edge: &Edge) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO edges
             (id, edge_type, source_id, target_id, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.id,
                edge.edge_type.as_str(),
                edge.source_id,
                edge.target_id,
                edge.metadata.created_at.to_rfc3339(),
                serde_json::to_string(edge)?,
            ],
        )?;
        Ok(())
    }

    pub async fn delete_edge(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        Ok(conn.execute("DELETE FROM edges WHERE id = ?1", [id])? > 0)
    }

    pub async fn get_all_edges(&self) -> anyhow::Result<Vec<Edge>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT data FROM edges")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut edges = Vec::new();
        for raw in rows {
            edges.push(serde_json::from_str(&raw?)?);
        }
        Ok(edges)
    }

    pub async fn put_session(&self, session: &Session) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (id, platform, started_at, is_active, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.platform,
                session.started_at.to_rfc3339(),
                session.is_active,
                serde_json::to_string(session)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_all_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT data FROM sessions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut sessions = Vec::new();
        for raw in rows {
            sessions.push(serde_json::from_str(&raw?)?);
        }
        Ok(sessions)
    }

    // ===== Bulk save / load =====

    /// Rewrite all live records in a single transaction and record
    /// `meta.stats` and `meta.lastSaved`.
    pub async fn save_graph(&self, snapshot: &GraphSnapshot) -> anyhow::Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM nodes", [])?;
        tx.execute("DELETE FROM edges", [])?;
        tx.execute("DELETE FROM sessions", [])?;

        for node in &snapshot.nodes {
            tx.execute(
                "INSERT INTO nodes
                 (id, node_type, platform, session_id, created_at, updated_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    node.id,
                    node.node_type.as_str(),
                    node.platform,
                    node.session_id,
                    node.metadata.created_at.to_rfc3339(),
                    node.metadata.updated_at.to_rfc3339(),
                    serde_json::to_string(node)?,
                ],
            )?;
        }
        for edge in &snapshot.edges {
            tx.execute(
                "INSERT INTO edges
                 (id, edge_type, source_id, target_id, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    edge.id,
                    edge.edge_type.as_str(),
                    edge.source_id,
                    edge.target_id,
                    edge.metadata.created_at.to_rfc3339(),
                    serde_json::to_string(edge)?,
                ],
            )?;
        }
        for session in &snapshot.sessions {
            tx.execute(
                "INSERT INTO sessions (id, platform, started_at, is_active, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.id,
                    session.platform,
                    session.started_at.to_rfc3339(),
                    session.is_active,
                    serde_json::to_string(session)?,
                ],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![META_STATS, serde_json::to_string(&snapshot.stats)?],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![META_LAST_SAVED, Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        debug!(
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            sessions = snapshot.sessions.len(),
            "graph saved"
        );
        Ok(())
    }

    /// Load the persisted graph, or `None` when nothing was ever saved.
    pub async fn load_graph(&self) -> anyhow::Result<Option<GraphSnapshot>> {
        let stats: Option<GraphStats> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
            let mut rows = stmt.query([META_STATS])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row.get(0)?;
                    serde_json::from_str(&raw).ok()
                }
                None => None,
            }
        };

        let nodes = self.get_all_nodes().await?;
        let edges = self.get_all_edges().await?;
        let sessions = self.get_all_sessions().await?;

        if nodes.is_empty() && edges.is_empty() && sessions.is_empty() && stats.is_none() {
            return Ok(None);
        }

        let stats = stats.unwrap_or_else(|| GraphStats {
            node_count: nodes.len(),
            edge_count: edges.len(),
            session_count: sessions.len(),
            last_modified: Utc::now(),
        });

        Ok(Some(GraphSnapshot {
            nodes,
            edges,
            sessions,
            stats,
        }))
    }

    pub async fn last_saved(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
        let mut rows = stmt.query([META_LAST_SAVED])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    // ===== Compaction =====

    /// Delete nodes older than `max_age` by created_at cursor.
    pub async fn prune_old_nodes(&self, max_age: Duration) -> anyhow::Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM nodes WHERE created_at < ?1", [cutoff])?;
        Ok(deleted)
    }

    /// Drop edges whose source or target no longer exists.
    pub async fn prune_orphaned_edges(&self) -> anyhow::Result<usize> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM edges WHERE source_id NOT IN (SELECT id FROM nodes)
                OR target_id NOT IN (SELECT id FROM nodes)",
            [],
        )?;
        Ok(deleted)
    }

    /// Delete nodes older than seven days whose relevance has fallen below
    /// `min_relevance`, then prune orphaned edges. Returns nodes removed.
    pub async fn compact(&self, min_relevance: f64) -> anyhow::Result<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::days(COMPACT_MIN_AGE_DAYS);
        let nodes = self.get_all_nodes().await?;

        let mut removed = 0;
        for node in nodes {
            if node.metadata.created_at < cutoff && node.relevance_score(now) < min_relevance {
                if self.delete_node(&node.id).await? {
                    removed += 1;
                }
            }
        }
        let orphans = self.prune_orphaned_edges().await?;
        debug!(removed, orphans, "store compacted");
        Ok(removed)
    }
}

/// Debounced persistence: bursts of mutations coalesce into one write
/// roughly half a second after the last schedule call.
pub struct ScheduledSaver {
    graph: Arc<RwLock<MemoryGraph>>,
    store: GraphStore,
    generation: Arc<AtomicU64>,
    delay: std::time::Duration,
}

impl ScheduledSaver {
    pub fn new(graph: Arc<RwLock<MemoryGraph>>, store: GraphStore) -> Self {
        Self::with_delay(graph, store, std::time::Duration::from_millis(500))
    }

    pub fn with_delay(
        graph: Arc<RwLock<MemoryGraph>>,
        store: GraphStore,
        delay: std::time::Duration,
    ) -> Self {
        Self {
            graph,
            store,
            generation: Arc::new(AtomicU64::new(0)),
            delay,
        }
    }

    /// Reset the debounce window; only the latest scheduled write runs.
    pub fn schedule(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let counter = Arc::clone(&self.generation);
        let graph = Arc::clone(&self.graph);
        let store = self.store.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if counter.load(Ordering::SeqCst) != generation {
                return;
            }
            let snapshot = graph.read().await.snapshot();
            if let Err(e) = store.save_graph(&snapshot).await {
                warn!("scheduled graph save failed: {}", e);
            }
        });
    }

    /// Immediate write, bypassing the debounce.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.graph.read().await.snapshot();
        self.store.save_graph(&snapshot).await
    }
}
