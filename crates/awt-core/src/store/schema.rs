//! SQL schema and record definitions for the persistence layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub text: String,
}

/// A stored conversation. `id` is canonical (`c_<hash>` when the source URL
/// carries `/c/<hash>`, otherwise a provisional `tmp_` key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Capture timestamp, unix milliseconds.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The single conversation-store document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationIndex {
    pub by_id: std::collections::HashMap<String, Conversation>,
    /// Live ids, most-recently-updated first. Each id appears exactly once.
    pub order: Vec<String>,
    pub url_to_id: std::collections::HashMap<String, String>,
}

/// Aggregate counts surfaced through `get_settings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub nodes: i64,
    pub edges: i64,
    pub sessions: i64,
    pub conversations: usize,
    pub jobs: usize,
}

pub const SCHEMA_SQL: &str = "
-- Graph nodes; full record JSON in data, filterable columns mirrored out
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    node_type TEXT NOT NULL,
    platform TEXT NOT NULL DEFAULT '',
    session_id TEXT,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    data TEXT NOT NULL
);
-- Graph edges
CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    edge_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    data TEXT NOT NULL
);
-- Graph sessions
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL DEFAULT '',
    started_at TIMESTAMP NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT FALSE,
    data TEXT NOT NULL
);
-- Store metadata (stats, lastSaved)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
-- Single-document KV collections (conversations, jobs, settings, notes)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Indexes
CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes (node_type);
CREATE INDEX IF NOT EXISTS idx_nodes_platform ON nodes (platform);
CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes (session_id);
CREATE INDEX IF NOT EXISTS idx_nodes_created ON nodes (created_at);
CREATE INDEX IF NOT EXISTS idx_nodes_type_platform ON nodes (node_type, platform);
CREATE INDEX IF NOT EXISTS idx_edges_type ON edges (edge_type);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges (source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges (target_id);
CREATE INDEX IF NOT EXISTS idx_edges_source_target ON edges (source_id, target_id);
CREATE INDEX IF NOT EXISTS idx_sessions_platform ON sessions (platform);
CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions (started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions (is_active);
";
