//! Record and enum definitions for the semantic memory graph

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node categories. Wire names are snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Language,
    Framework,
    Library,
    CodeBlock,
    Function,
    Class,
    File,
    Error,
    Bug,
    Issue,
    Project,
    Task,
    Goal,
    Feature,
    Topic,
    Concept,
    Technology,
    Url,
    Documentation,
    Api,
    Conversation,
    Prompt,
    Response,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Language => "language",
            NodeType::Framework => "framework",
            NodeType::Library => "library",
            NodeType::CodeBlock => "code_block",
            NodeType::Function => "function",
            NodeType::Class => "class",
            NodeType::File => "file",
            NodeType::Error => "error",
            NodeType::Bug => "bug",
            NodeType::Issue => "issue",
            NodeType::Project => "project",
            NodeType::Task => "task",
            NodeType::Goal => "goal",
            NodeType::Feature => "feature",
            NodeType::Topic => "topic",
            NodeType::Concept => "concept",
            NodeType::Technology => "technology",
            NodeType::Url => "url",
            NodeType::Documentation => "documentation",
            NodeType::Api => "api",
            NodeType::Conversation => "conversation",
            NodeType::Prompt => "prompt",
            NodeType::Response => "response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "language" => Some(NodeType::Language),
            "framework" => Some(NodeType::Framework),
            "library" => Some(NodeType::Library),
            "code_block" => Some(NodeType::CodeBlock),
            "function" => Some(NodeType::Function),
            "class" => Some(NodeType::Class),
            "file" => Some(NodeType::File),
            "error" => Some(NodeType::Error),
            "bug" => Some(NodeType::Bug),
            "issue" => Some(NodeType::Issue),
            "project" => Some(NodeType::Project),
            "task" => Some(NodeType::Task),
            "goal" => Some(NodeType::Goal),
            "feature" => Some(NodeType::Feature),
            "topic" => Some(NodeType::Topic),
            "concept" => Some(NodeType::Concept),
            "technology" => Some(NodeType::Technology),
            "url" => Some(NodeType::Url),
            "documentation" => Some(NodeType::Documentation),
            "api" => Some(NodeType::Api),
            "conversation" => Some(NodeType::Conversation),
            "prompt" => Some(NodeType::Prompt),
            "response" => Some(NodeType::Response),
            _ => None,
        }
    }
}

/// Relationship categories between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Uses,
    Implements,
    DependsOn,
    PartOf,
    Contains,
    CausedBy,
    SolvedBy,
    RelatedTo,
    FollowedBy,
    PrecededBy,
    MentionedIn,
    DiscussedWith,
    LearnedFrom,
    SimilarTo,
    ContrastsWith,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Uses => "uses",
            EdgeType::Implements => "implements",
            EdgeType::DependsOn => "depends_on",
            EdgeType::PartOf => "part_of",
            EdgeType::Contains => "contains",
            EdgeType::CausedBy => "caused_by",
            EdgeType::SolvedBy => "solved_by",
            EdgeType::RelatedTo => "related_to",
            EdgeType::FollowedBy => "followed_by",
            EdgeType::PrecededBy => "preceded_by",
            EdgeType::MentionedIn => "mentioned_in",
            EdgeType::DiscussedWith => "discussed_with",
            EdgeType::LearnedFrom => "learned_from",
            EdgeType::SimilarTo => "similar_to",
            EdgeType::ContrastsWith => "contrasts_with",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uses" => Some(EdgeType::Uses),
            "implements" => Some(EdgeType::Implements),
            "depends_on" => Some(EdgeType::DependsOn),
            "part_of" => Some(EdgeType::PartOf),
            "contains" => Some(EdgeType::Contains),
            "caused_by" => Some(EdgeType::CausedBy),
            "solved_by" => Some(EdgeType::SolvedBy),
            "related_to" => Some(EdgeType::RelatedTo),
            "followed_by" => Some(EdgeType::FollowedBy),
            "preceded_by" => Some(EdgeType::PrecededBy),
            "mentioned_in" => Some(EdgeType::MentionedIn),
            "discussed_with" => Some(EdgeType::DiscussedWith),
            "learned_from" => Some(EdgeType::LearnedFrom),
            "similar_to" => Some(EdgeType::SimilarTo),
            "contrasts_with" => Some(EdgeType::ContrastsWith),
            _ => None,
        }
    }
}

/// Timestamps, access bookkeeping, and free-form keys carried by every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            access_count: 0,
            last_accessed_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A unit of the semantic graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub content: String,
    pub metadata: NodeMetadata,
    pub importance: f64,
    pub confidence: f64,
    pub decay: f64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Reserved slot for a future embedding pipeline; never computed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f64>>,
}

pub const DEFAULT_IMPORTANCE: f64 = 0.5;
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

impl Node {
    pub fn new(node_type: NodeType, content: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_type,
            content,
            metadata: NodeMetadata::new(now),
            importance: DEFAULT_IMPORTANCE,
            confidence: DEFAULT_CONFIDENCE,
            decay: 1.0,
            source: String::new(),
            platform: String::new(),
            session_id: None,
            embedding: None,
        }
    }

    /// Record an access: bump the counter, refresh the access timestamp, and
    /// reinforce decay by +0.1 (clamped to 1.0). When a new importance is
    /// supplied the node keeps the maximum of old and new.
    pub fn touch(&mut self, now: DateTime<Utc>, importance: Option<f64>) {
        self.metadata.access_count += 1;
        self.metadata.last_accessed_at = Some(now);
        self.metadata.updated_at = now;
        self.decay = (self.decay + 0.1).min(1.0);
        if let Some(imp) = importance {
            self.importance = self.importance.max(imp);
        }
    }

    /// Composite relevance in [0, 1]:
    ///
    /// `(0.30·importance + 0.20·confidence + 0.25·timeDecay
    ///   + 0.15·recencyBoost + 0.10·accessBoost) · decay`
    ///
    /// where timeDecay halves every 24 h of age, recencyBoost falls off
    /// exponentially over hours since last access (zero if never accessed),
    /// and accessBoost grows logarithmically with the access count.
    pub fn relevance_score(&self, now: DateTime<Utc>) -> f64 {
        let age_hours = hours_between(self.metadata.created_at, now);
        let time_decay = 0.5_f64.powf(age_hours / 24.0);

        let recency_boost = match self.metadata.last_accessed_at {
            Some(at) => (-hours_between(at, now) / 4.0).exp() * 0.3,
            None => 0.0,
        };

        let access_boost = (1.0 + self.metadata.access_count as f64).ln() * 0.1;

        let score = (0.30 * self.importance
            + 0.20 * self.confidence
            + 0.25 * time_decay
            + 0.15 * recency_boost
            + 0.10 * access_boost)
            * self.decay;

        score.clamp(0.0, 1.0)
    }
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let ms = to.signed_duration_since(from).num_milliseconds();
    (ms.max(0) as f64) / 3_600_000.0
}

/// Timestamps and free-form keys carried by every edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EdgeMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }
}

pub const EDGE_WEIGHT_DEFAULT: f64 = 1.0;
pub const EDGE_WEIGHT_MIN: f64 = 0.1;
pub const EDGE_WEIGHT_MAX: f64 = 2.0;

/// A typed, weighted connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub weight: f64,
    #[serde(default)]
    pub bidirectional: bool,
    pub metadata: EdgeMetadata,
}

impl Edge {
    pub fn new(
        source_id: String,
        target_id: String,
        edge_type: EdgeType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id,
            target_id,
            edge_type,
            weight: EDGE_WEIGHT_DEFAULT,
            bidirectional: false,
            metadata: EdgeMetadata::new(now),
        }
    }

    /// Strengthen a repeated relationship: +0.1 weight, clamped to 2.0.
    pub fn reinforce(&mut self, now: DateTime<Utc>) {
        self.weight = (self.weight + 0.1).clamp(EDGE_WEIGHT_MIN, EDGE_WEIGHT_MAX);
        self.metadata.updated_at = now;
    }
}

/// A temporal bundle of nodes co-created while one chat is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub prompt_count: u32,
    #[serde(default)]
    pub response_count: u32,
    #[serde(default)]
    pub code_block_count: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub primary_language: Option<String>,
    #[serde(default)]
    pub primary_framework: Option<String>,
    #[serde(default)]
    pub primary_topic: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            ended_at: None,
            platform: String::new(),
            url: String::new(),
            title: String::new(),
            description: String::new(),
            tags: Vec::new(),
            node_ids: Vec::new(),
            prompt_count: 0,
            response_count: 0,
            code_block_count: 0,
            error_count: 0,
            primary_language: None,
            primary_framework: None,
            primary_topic: None,
            is_active: true,
        }
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.is_active = false;
    }

    pub fn add_node(&mut self, node_id: &str) {
        if !self.node_ids.iter().any(|id| id == node_id) {
            self.node_ids.push(node_id.to_string());
        }
    }
}

/// Aggregate counters tracked on every mutation; `last_modified` drives
/// full-sync reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub session_count: usize,
    pub last_modified: DateTime<Utc>,
}

impl GraphStats {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            node_count: 0,
            edge_count: 0,
            session_count: 0,
            last_modified: now,
        }
    }
}

/// Full serialized graph state used for persistence and full-sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub sessions: Vec<Session>,
    pub stats: GraphStats,
}

/// Per-type node counts, reported through the router's stats block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphTypeCounts {
    pub by_node_type: HashMap<String, usize>,
    pub by_edge_type: HashMap<String, usize>,
}

/// Deduplication hash over `type:content`: 32-bit FNV-1a encoded base-36.
/// Fast and collision-acceptable; dedup only, never security-sensitive.
pub fn content_hash(node_type: NodeType, content: &str) -> String {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in node_type
        .as_str()
        .bytes()
        .chain(std::iter::once(b':'))
        .chain(content.bytes())
    {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    to_base36(hash)
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}
