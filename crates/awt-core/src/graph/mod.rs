//! In-memory semantic graph: typed nodes and weighted edges with
//! content-hash deduplication, decay-based relevance, and change events.
//!
//! The graph is the authoritative per-tab state. All mutations are local
//! and synchronous; persistence and cross-tab broadcast are layered above
//! and driven by the [`GraphEvent`] stream.

pub mod schema;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::Map;
use tokio::sync::mpsc;
use tracing::debug;

pub use schema::{
    content_hash, Edge, EdgeType, GraphSnapshot, GraphStats, GraphTypeCounts, Node, NodeType,
    Session,
};

/// Change notification emitted synchronously after a mutation lands.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    NodeAdded(Node),
    NodeUpdated(Node),
    NodeRemoved { node_id: String },
    EdgeAdded(Edge),
    EdgeRemoved { edge_id: String },
    SessionStarted(Session),
    SessionEnded {
        session_id: String,
        ended_at: DateTime<Utc>,
    },
}

/// Optional fields accepted when creating or touching a node.
#[derive(Debug, Clone, Default)]
pub struct NodeDraft {
    pub importance: Option<f64>,
    pub confidence: Option<f64>,
    pub source: Option<String>,
    pub platform: Option<String>,
    pub session_id: Option<String>,
    pub extra: Map<String, serde_json::Value>,
}

/// Optional fields accepted when creating an edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeDraft {
    pub weight: Option<f64>,
    pub bidirectional: bool,
    pub extra: Map<String, serde_json::Value>,
}

/// Partial update applied to an existing node.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub confidence: Option<f64>,
}

/// Descriptive fields for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionDraft {
    pub platform: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Relevance,
    Created,
    Accessed,
}

/// Node query filter; unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    pub types: Vec<NodeType>,
    pub platform: Option<String>,
    pub session_id: Option<String>,
    pub content_contains: Option<String>,
    pub min_relevance: Option<f64>,
    pub within_hours: Option<f64>,
    pub sort: SortBy,
    pub limit: Option<usize>,
}

impl QueryCriteria {
    pub fn of_type(node_type: NodeType) -> Self {
        Self {
            types: vec![node_type],
            ..Default::default()
        }
    }
}

/// Connected fragment returned by [`MemoryGraph::get_subgraph`].
#[derive(Debug, Clone, Default)]
pub struct Subgraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

const DECAY_FLOOR: f64 = 0.1;

/// The in-memory graph: two primary tables keyed by id, four secondary
/// indices, and a content-hash dedup map. Every traversal is an id lookup;
/// there are no owning pointers between records.
pub struct MemoryGraph {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    sessions: HashMap<String, Session>,

    nodes_by_type: HashMap<NodeType, HashSet<String>>,
    edges_by_type: HashMap<EdgeType, HashSet<String>>,
    /// node id -> ids of edges leaving it (includes the reverse direction
    /// of bidirectional edges)
    outgoing: HashMap<String, HashSet<String>>,
    /// node id -> ids of edges arriving at it
    incoming: HashMap<String, HashSet<String>>,
    /// content hash -> node id
    content_index: HashMap<String, String>,

    active_session_id: Option<String>,
    last_modified: DateTime<Utc>,
    listeners: Vec<mpsc::UnboundedSender<GraphEvent>>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            sessions: HashMap::new(),
            nodes_by_type: HashMap::new(),
            edges_by_type: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            content_index: HashMap::new(),
            active_session_id: None,
            // Epoch until the first mutation, so a fresh tab always accepts
            // a peer's full-sync snapshot.
            last_modified: DateTime::UNIX_EPOCH,
            listeners: Vec::new(),
        }
    }

    /// Register a change listener. Dropped receivers are pruned lazily.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<GraphEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: GraphEvent) {
        self.listeners
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn mark_modified(&mut self, now: DateTime<Utc>) {
        self.last_modified = now;
    }

    // ===== Node mutations =====

    /// Add a node, deduplicated on (type, content hash). Re-adding an
    /// existing pair touches the node instead of creating a duplicate.
    pub fn add_node(&mut self, node_type: NodeType, content: &str, draft: NodeDraft) -> Node {
        let now = Utc::now();
        let hash = content_hash(node_type, content);

        if let Some(existing_id) = self.content_index.get(&hash).cloned() {
            if let Some(node) = self.nodes.get_mut(&existing_id) {
                node.touch(now, draft.importance);
                for (k, v) in draft.extra {
                    node.metadata.extra.insert(k, v);
                }
                let snapshot = node.clone();
                self.mark_modified(now);
                self.emit(GraphEvent::NodeUpdated(snapshot.clone()));
                return snapshot;
            }
        }

        let mut node = Node::new(node_type, content.to_string(), now);
        if let Some(imp) = draft.importance {
            node.importance = imp.clamp(0.0, 1.0);
        }
        if let Some(conf) = draft.confidence {
            node.confidence = conf.clamp(0.0, 1.0);
        }
        if let Some(source) = draft.source {
            node.source = source;
        }
        if let Some(platform) = draft.platform {
            node.platform = platform;
        }
        node.metadata.extra = draft.extra;
        node.session_id = draft.session_id.or_else(|| self.active_session_id.clone());

        if let Some(session_id) = node.session_id.clone() {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.add_node(&node.id);
            }
        }

        self.insert_node_record(node.clone(), hash);
        self.mark_modified(now);
        self.emit(GraphEvent::NodeAdded(node.clone()));
        node
    }

    /// Patch a node in place. Content changes rehash the dedup index;
    /// `created_at` is never altered.
    pub fn update_node(&mut self, id: &str, patch: NodePatch) -> Option<Node> {
        let now = Utc::now();
        let node = self.nodes.get_mut(id)?;

        if let Some(content) = patch.content {
            let old_hash = content_hash(node.node_type, &node.content);
            self.content_index.remove(&old_hash);
            node.content = content;
            let new_hash = content_hash(node.node_type, &node.content);
            self.content_index.insert(new_hash, id.to_string());
        }
        // Re-borrow after the index juggling above.
        let node = self.nodes.get_mut(id)?;
        if let Some(imp) = patch.importance {
            node.importance = imp.clamp(0.0, 1.0);
        }
        if let Some(conf) = patch.confidence {
            node.confidence = conf.clamp(0.0, 1.0);
        }
        node.metadata.updated_at = now;

        let snapshot = node.clone();
        self.mark_modified(now);
        self.emit(GraphEvent::NodeUpdated(snapshot.clone()));
        Some(snapshot)
    }

    /// Remove a node and, atomically with it, every incident edge and every
    /// session membership. Idempotent.
    pub fn remove_node(&mut self, id: &str) -> bool {
        if !self.nodes.contains_key(id) {
            return false;
        }
        let now = Utc::now();

        let mut incident: HashSet<String> = HashSet::new();
        if let Some(out) = self.outgoing.get(id) {
            incident.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(id) {
            incident.extend(inc.iter().cloned());
        }
        for edge_id in incident {
            if self.remove_edge_record(&edge_id) {
                self.emit(GraphEvent::EdgeRemoved { edge_id });
            }
        }

        self.detach_node_record(id);
        for session in self.sessions.values_mut() {
            session.node_ids.retain(|n| n != id);
        }

        self.mark_modified(now);
        self.emit(GraphEvent::NodeRemoved {
            node_id: id.to_string(),
        });
        true
    }

    // ===== Edge mutations =====

    /// Connect two live nodes. A repeat of the same (source, target, type)
    /// reinforces the existing edge instead of duplicating it. Returns
    /// `None` when either endpoint is missing.
    pub fn add_edge(
        &mut self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
        draft: EdgeDraft,
    ) -> Option<Edge> {
        if !self.nodes.contains_key(source_id) || !self.nodes.contains_key(target_id) {
            debug!(source_id, target_id, "edge endpoints missing, skipping");
            return None;
        }
        let now = Utc::now();

        if let Some(existing_id) = self.find_edge(source_id, target_id, edge_type) {
            let edge = self.edges.get_mut(&existing_id)?;
            edge.reinforce(now);
            let snapshot = edge.clone();
            self.mark_modified(now);
            self.emit(GraphEvent::EdgeAdded(snapshot.clone()));
            return Some(snapshot);
        }

        let mut edge = Edge::new(source_id.to_string(), target_id.to_string(), edge_type, now);
        if let Some(weight) = draft.weight {
            edge.weight = weight.clamp(schema::EDGE_WEIGHT_MIN, schema::EDGE_WEIGHT_MAX);
        }
        edge.bidirectional = draft.bidirectional;
        edge.metadata.extra = draft.extra;

        self.insert_edge_record(edge.clone());
        self.mark_modified(now);
        self.emit(GraphEvent::EdgeAdded(edge.clone()));
        Some(edge)
    }

    /// Remove an edge by id. Idempotent.
    pub fn remove_edge(&mut self, id: &str) -> bool {
        let removed = self.remove_edge_record(id);
        if removed {
            self.mark_modified(Utc::now());
            self.emit(GraphEvent::EdgeRemoved {
                edge_id: id.to_string(),
            });
        }
        removed
    }

    /// Look up an edge id by endpoints and type.
    pub fn find_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
    ) -> Option<String> {
        let candidates = self.outgoing.get(source_id)?;
        candidates
            .iter()
            .find(|edge_id| {
                self.edges.get(*edge_id).is_some_and(|e| {
                    e.edge_type == edge_type
                        && ((e.source_id == source_id && e.target_id == target_id)
                            || (e.bidirectional
                                && e.source_id == target_id
                                && e.target_id == source_id))
                })
            })
            .cloned()
    }

    // ===== Reads =====

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<&Node> {
        self.nodes_by_type
            .get(&node_type)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    /// Filter and rank nodes. See [`QueryCriteria`]; relevance sorting uses
    /// the composite score from [`Node::relevance_score`].
    pub fn query(&self, criteria: &QueryCriteria) -> Vec<Node> {
        self.query_at(criteria, Utc::now())
    }

    pub fn query_at(&self, criteria: &QueryCriteria, now: DateTime<Utc>) -> Vec<Node> {
        let needle = criteria.content_contains.as_deref().map(str::to_lowercase);
        let cutoff = criteria
            .within_hours
            .map(|h| now - Duration::milliseconds((h * 3_600_000.0) as i64));

        let mut matched: Vec<&Node> = self
            .nodes
            .values()
            .filter(|node| {
                if !criteria.types.is_empty() && !criteria.types.contains(&node.node_type) {
                    return false;
                }
                if let Some(platform) = &criteria.platform {
                    if &node.platform != platform {
                        return false;
                    }
                }
                if let Some(session_id) = &criteria.session_id {
                    if node.session_id.as_deref() != Some(session_id.as_str()) {
                        return false;
                    }
                }
                if let Some(needle) = &needle {
                    if !node.content.to_lowercase().contains(needle) {
                        return false;
                    }
                }
                if let Some(cutoff) = cutoff {
                    if node.metadata.created_at < cutoff {
                        return false;
                    }
                }
                if let Some(min) = criteria.min_relevance {
                    if node.relevance_score(now) < min {
                        return false;
                    }
                }
                true
            })
            .collect();

        match criteria.sort {
            SortBy::Relevance => matched.sort_by(|a, b| {
                b.relevance_score(now)
                    .partial_cmp(&a.relevance_score(now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            SortBy::Created => {
                matched.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at))
            }
            SortBy::Accessed => matched.sort_by(|a, b| {
                b.metadata
                    .last_accessed_at
                    .cmp(&a.metadata.last_accessed_at)
            }),
        }

        let limit = criteria.limit.unwrap_or(usize::MAX);
        matched.into_iter().take(limit).cloned().collect()
    }

    /// Breadth-limited bidirectional traversal from a start node, returning
    /// the deduplicated nodes and edges within `depth` hops.
    pub fn get_subgraph(&self, start_node_id: &str, depth: usize) -> Subgraph {
        let mut result = Subgraph::default();
        let Some(start) = self.nodes.get(start_node_id) else {
            return result;
        };

        let mut seen_nodes: HashSet<String> = HashSet::new();
        let mut seen_edges: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        seen_nodes.insert(start.id.clone());
        result.nodes.push(start.clone());
        queue.push_back((start.id.clone(), 0));

        while let Some((node_id, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            let mut incident: Vec<&String> = Vec::new();
            if let Some(out) = self.outgoing.get(&node_id) {
                incident.extend(out.iter());
            }
            if let Some(inc) = self.incoming.get(&node_id) {
                incident.extend(inc.iter());
            }
            for edge_id in incident {
                let Some(edge) = self.edges.get(edge_id) else {
                    continue;
                };
                if seen_edges.insert(edge.id.clone()) {
                    result.edges.push(edge.clone());
                }
                let neighbor = if edge.source_id == node_id {
                    &edge.target_id
                } else {
                    &edge.source_id
                };
                if seen_nodes.insert(neighbor.clone()) {
                    if let Some(n) = self.nodes.get(neighbor) {
                        result.nodes.push(n.clone());
                    }
                    queue.push_back((neighbor.clone(), dist + 1));
                }
            }
        }
        result
    }

    // ===== Maintenance =====

    /// Erode every node's decay scalar. Maintenance-only; no events are
    /// emitted (mass decay is recomputed independently on every tab).
    pub fn apply_decay(&mut self, amount: f64) {
        for node in self.nodes.values_mut() {
            node.decay = (node.decay - amount).max(DECAY_FLOOR);
        }
        self.mark_modified(Utc::now());
    }

    /// Periodic upkeep with the standard knobs: erode decay by 0.01 and
    /// drop nodes older than a week whose relevance fell under 0.05.
    pub fn maintain(&mut self) -> usize {
        self.apply_decay(0.01);
        self.prune(0.05, Duration::days(7))
    }

    /// Delete nodes older than `min_age` whose relevance has fallen below
    /// `min_relevance`. Incident edges go with them. Returns removed count.
    pub fn prune(&mut self, min_relevance: f64, min_age: Duration) -> usize {
        let now = Utc::now();
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| {
                now.signed_duration_since(n.metadata.created_at) >= min_age
                    && n.relevance_score(now) < min_relevance
            })
            .map(|n| n.id.clone())
            .collect();

        let count = doomed.len();
        for id in doomed {
            self.remove_node(&id);
        }
        count
    }

    // ===== Sessions =====

    /// Start a new active session, ending the previous one if any.
    pub fn start_session(&mut self, draft: SessionDraft) -> Session {
        let now = Utc::now();
        self.end_active_session();

        let mut session = Session::new(now);
        session.platform = draft.platform;
        session.url = draft.url;
        session.title = draft.title;
        session.description = draft.description;
        session.tags = draft.tags;

        self.active_session_id = Some(session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        self.mark_modified(now);
        self.emit(GraphEvent::SessionStarted(session.clone()));
        session
    }

    /// End a session by id.
    pub fn end_session(&mut self, id: &str) -> Option<Session> {
        let now = Utc::now();
        let session = self.sessions.get_mut(id)?;
        if session.ended_at.is_none() {
            session.end(now);
        }
        let snapshot = session.clone();
        if self.active_session_id.as_deref() == Some(id) {
            self.active_session_id = None;
        }
        self.mark_modified(now);
        self.emit(GraphEvent::SessionEnded {
            session_id: snapshot.id.clone(),
            ended_at: now,
        });
        Some(snapshot)
    }

    pub fn end_active_session(&mut self) -> Option<Session> {
        let id = self.active_session_id.clone()?;
        self.end_session(&id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id
            .as_deref()
            .and_then(|id| self.sessions.get(id))
    }

    /// Mutable access for extractor side-effects (counters, primaries).
    pub fn active_session_mut(&mut self) -> Option<&mut Session> {
        let id = self.active_session_id.clone()?;
        self.sessions.get_mut(&id)
    }

    pub fn get_session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Sessions by `started_at`, newest first.
    pub fn get_recent_sessions(&self, limit: usize) -> Vec<Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.into_iter().take(limit).cloned().collect()
    }

    // ===== Snapshot round-trip =====

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            session_count: self.sessions.len(),
            last_modified: self.last_modified,
        }
    }

    pub fn type_counts(&self) -> GraphTypeCounts {
        let mut counts = GraphTypeCounts::default();
        for (node_type, ids) in &self.nodes_by_type {
            counts
                .by_node_type
                .insert(node_type.as_str().to_string(), ids.len());
        }
        for (edge_type, ids) in &self.edges_by_type {
            counts
                .by_edge_type
                .insert(edge_type.as_str().to_string(), ids.len());
        }
        counts
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            sessions: self.sessions.values().cloned().collect(),
            stats: self.stats(),
        }
    }

    /// Replace the entire in-memory state from a snapshot, rebuilding every
    /// secondary index from the primary records. Emits no events.
    pub fn restore(&mut self, snapshot: GraphSnapshot) {
        self.nodes.clear();
        self.edges.clear();
        self.sessions.clear();
        self.nodes_by_type.clear();
        self.edges_by_type.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.content_index.clear();
        self.active_session_id = None;

        for node in snapshot.nodes {
            let hash = content_hash(node.node_type, &node.content);
            self.insert_node_record(node, hash);
        }
        for edge in snapshot.edges {
            if self.nodes.contains_key(&edge.source_id) && self.nodes.contains_key(&edge.target_id)
            {
                self.insert_edge_record(edge);
            }
        }
        for session in snapshot.sessions {
            if session.is_active {
                self.active_session_id = Some(session.id.clone());
            }
            self.sessions.insert(session.id.clone(), session);
        }
        self.last_modified = snapshot.stats.last_modified;
    }

    // ===== Remote application (sync; no event echo) =====

    /// Apply a node received from a peer: insert when absent, otherwise
    /// newer-wins on `metadata.updated_at` (ties favor the incoming record).
    pub fn apply_remote_node(&mut self, node: Node) -> bool {
        let apply = match self.nodes.get(&node.id) {
            None => true,
            Some(existing) => node.metadata.updated_at >= existing.metadata.updated_at,
        };
        if !apply {
            return false;
        }
        if let Some(existing) = self.nodes.get(&node.id).cloned() {
            let old_hash = content_hash(existing.node_type, &existing.content);
            self.content_index.remove(&old_hash);
            if let Some(ids) = self.nodes_by_type.get_mut(&existing.node_type) {
                ids.remove(&existing.id);
            }
            self.nodes.remove(&existing.id);
        }
        let hash = content_hash(node.node_type, &node.content);
        self.insert_node_record(node, hash);
        self.mark_modified(Utc::now());
        true
    }

    pub fn apply_remote_node_removal(&mut self, node_id: &str) {
        if !self.nodes.contains_key(node_id) {
            return;
        }
        let mut incident: HashSet<String> = HashSet::new();
        if let Some(out) = self.outgoing.get(node_id) {
            incident.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(node_id) {
            incident.extend(inc.iter().cloned());
        }
        for edge_id in incident {
            self.remove_edge_record(&edge_id);
        }
        self.detach_node_record(node_id);
        for session in self.sessions.values_mut() {
            session.node_ids.retain(|n| n != node_id);
        }
        self.mark_modified(Utc::now());
    }

    /// Edges are add-once across tabs: apply only when no semantically equal
    /// edge exists and both endpoints are live.
    pub fn apply_remote_edge(&mut self, edge: Edge) -> bool {
        if self.edges.contains_key(&edge.id) {
            return false;
        }
        if !self.nodes.contains_key(&edge.source_id) || !self.nodes.contains_key(&edge.target_id) {
            return false;
        }
        if self
            .find_edge(&edge.source_id, &edge.target_id, edge.edge_type)
            .is_some()
        {
            return false;
        }
        self.insert_edge_record(edge);
        self.mark_modified(Utc::now());
        true
    }

    pub fn apply_remote_edge_removal(&mut self, edge_id: &str) {
        if self.remove_edge_record(edge_id) {
            self.mark_modified(Utc::now());
        }
    }

    pub fn apply_remote_session_started(&mut self, session: Session) {
        if self.sessions.contains_key(&session.id) {
            return;
        }
        self.sessions.insert(session.id.clone(), session);
        self.mark_modified(Utc::now());
    }

    pub fn apply_remote_session_ended(&mut self, session_id: &str, ended_at: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.ended_at = Some(ended_at);
            session.is_active = false;
            if self.active_session_id.as_deref() == Some(session_id) {
                self.active_session_id = None;
            }
            self.mark_modified(Utc::now());
        }
    }

    // ===== Index plumbing =====

    fn insert_node_record(&mut self, node: Node, hash: String) {
        self.nodes_by_type
            .entry(node.node_type)
            .or_default()
            .insert(node.id.clone());
        self.content_index.insert(hash, node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    fn detach_node_record(&mut self, id: &str) {
        if let Some(node) = self.nodes.remove(id) {
            if let Some(ids) = self.nodes_by_type.get_mut(&node.node_type) {
                ids.remove(id);
            }
            let hash = content_hash(node.node_type, &node.content);
            if self.content_index.get(&hash).map(String::as_str) == Some(id) {
                self.content_index.remove(&hash);
            }
        }
        self.outgoing.remove(id);
        self.incoming.remove(id);
    }

    fn insert_edge_record(&mut self, edge: Edge) {
        self.edges_by_type
            .entry(edge.edge_type)
            .or_default()
            .insert(edge.id.clone());
        self.outgoing
            .entry(edge.source_id.clone())
            .or_default()
            .insert(edge.id.clone());
        self.incoming
            .entry(edge.target_id.clone())
            .or_default()
            .insert(edge.id.clone());
        if edge.bidirectional {
            self.outgoing
                .entry(edge.target_id.clone())
                .or_default()
                .insert(edge.id.clone());
            self.incoming
                .entry(edge.source_id.clone())
                .or_default()
                .insert(edge.id.clone());
        }
        self.edges.insert(edge.id.clone(), edge);
    }

    fn remove_edge_record(&mut self, id: &str) -> bool {
        let Some(edge) = self.edges.remove(id) else {
            return false;
        };
        if let Some(ids) = self.edges_by_type.get_mut(&edge.edge_type) {
            ids.remove(id);
        }
        for endpoint in [&edge.source_id, &edge.target_id] {
            if let Some(out) = self.outgoing.get_mut(endpoint) {
                out.remove(id);
            }
            if let Some(inc) = self.incoming.get_mut(endpoint) {
                inc.remove(id);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_pair() -> (MemoryGraph, String, String) {
        let mut graph = MemoryGraph::new();
        let a = graph.add_node(NodeType::Language, "python", NodeDraft::default());
        let b = graph.add_node(NodeType::Framework, "django", NodeDraft::default());
        (graph, a.id, b.id)
    }

    // ===== Dedup (graph law 1) =====

    #[test]
    fn test_add_node_dedup_touches_existing() {
        let mut graph = MemoryGraph::new();
        let first = graph.add_node(
            NodeType::Language,
            "python",
            NodeDraft {
                importance: Some(0.4),
                ..Default::default()
            },
        );
        let second = graph.add_node(
            NodeType::Language,
            "python",
            NodeDraft {
                importance: Some(0.7),
                ..Default::default()
            },
        );

        assert_eq!(first.id, second.id);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(second.metadata.access_count, 1);
        assert!((second.importance - 0.7).abs() < 1e-12);

        // Same content, different type: distinct node.
        let topic = graph.add_node(NodeType::Topic, "python", NodeDraft::default());
        assert_ne!(topic.id, first.id);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_dedup_importance_never_lowered() {
        let mut graph = MemoryGraph::new();
        graph.add_node(
            NodeType::Language,
            "rust",
            NodeDraft {
                importance: Some(0.9),
                ..Default::default()
            },
        );
        let again = graph.add_node(
            NodeType::Language,
            "rust",
            NodeDraft {
                importance: Some(0.1),
                ..Default::default()
            },
        );
        assert!((again.importance - 0.9).abs() < 1e-12);
    }

    // ===== Edges =====

    #[test]
    fn test_add_edge_missing_endpoint_returns_none() {
        let (mut graph, a, _) = graph_with_pair();
        assert!(graph
            .add_edge(&a, "ghost", EdgeType::Uses, EdgeDraft::default())
            .is_none());
    }

    #[test]
    fn test_add_edge_repeat_reinforces() {
        let (mut graph, a, b) = graph_with_pair();
        let e1 = graph
            .add_edge(&b, &a, EdgeType::PartOf, EdgeDraft::default())
            .unwrap();
        let e2 = graph
            .add_edge(&b, &a, EdgeType::PartOf, EdgeDraft::default())
            .unwrap();
        assert_eq!(e1.id, e2.id);
        assert_eq!(graph.edge_count(), 1);
        assert!((e2.weight - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_bidirectional_edge_traversable_both_ways() {
        let (mut graph, a, b) = graph_with_pair();
        graph
            .add_edge(
                &a,
                &b,
                EdgeType::RelatedTo,
                EdgeDraft {
                    bidirectional: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let from_b = graph.get_subgraph(&b, 1);
        assert_eq!(from_b.nodes.len(), 2);
        assert_eq!(from_b.edges.len(), 1);
    }

    // ===== Removal (graph law 2) =====

    #[test]
    fn test_remove_node_drops_incident_edges_and_session_refs() {
        let mut graph = MemoryGraph::new();
        graph.start_session(SessionDraft::default());
        let a = graph.add_node(NodeType::Language, "go", NodeDraft::default());
        let b = graph.add_node(NodeType::Framework, "gin", NodeDraft::default());
        let c = graph.add_node(NodeType::Topic, "web development", NodeDraft::default());
        graph
            .add_edge(&b.id, &a.id, EdgeType::PartOf, EdgeDraft::default())
            .unwrap();
        graph
            .add_edge(&c.id, &a.id, EdgeType::RelatedTo, EdgeDraft::default())
            .unwrap();

        assert!(graph.remove_node(&a.id));
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.get_node(&a.id).is_none());
        let session = graph.active_session().unwrap();
        assert!(!session.node_ids.contains(&a.id));

        // Idempotent.
        assert!(!graph.remove_node(&a.id));
    }

    // ===== Query (graph law 3) =====

    #[test]
    fn test_query_min_relevance_respected() {
        let mut graph = MemoryGraph::new();
        for i in 0..5 {
            let node = graph.add_node(
                NodeType::Topic,
                &format!("topic-{}", i),
                NodeDraft {
                    importance: Some(0.1 + i as f64 * 0.2),
                    ..Default::default()
                },
            );
            // Age half of them out via decay so scores spread.
            if i % 2 == 0 {
                graph
                    .nodes
                    .get_mut(&node.id)
                    .unwrap()
                    .decay = 0.2;
            }
        }
        let now = Utc::now();
        let results = graph.query_at(
            &QueryCriteria {
                min_relevance: Some(0.3),
                ..Default::default()
            },
            now,
        );
        assert!(results
            .iter()
            .all(|n| n.relevance_score(now) >= 0.3));
    }

    #[test]
    fn test_query_filters_and_limit() {
        let mut graph = MemoryGraph::new();
        graph.add_node(
            NodeType::Language,
            "python",
            NodeDraft {
                platform: Some("chatgpt".into()),
                ..Default::default()
            },
        );
        graph.add_node(
            NodeType::Language,
            "rust",
            NodeDraft {
                platform: Some("claude".into()),
                ..Default::default()
            },
        );
        graph.add_node(NodeType::Topic, "python packaging", NodeDraft::default());

        let by_type = graph.query(&QueryCriteria::of_type(NodeType::Language));
        assert_eq!(by_type.len(), 2);

        let by_platform = graph.query(&QueryCriteria {
            platform: Some("chatgpt".into()),
            ..Default::default()
        });
        assert_eq!(by_platform.len(), 1);
        assert_eq!(by_platform[0].content, "python");

        let by_content = graph.query(&QueryCriteria {
            content_contains: Some("PYTHON".into()),
            ..Default::default()
        });
        assert_eq!(by_content.len(), 2);

        let limited = graph.query(&QueryCriteria {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    // ===== Subgraph =====

    #[test]
    fn test_subgraph_depth_limits_traversal() {
        let mut graph = MemoryGraph::new();
        let a = graph.add_node(NodeType::Topic, "a", NodeDraft::default());
        let b = graph.add_node(NodeType::Topic, "b", NodeDraft::default());
        let c = graph.add_node(NodeType::Topic, "c", NodeDraft::default());
        graph
            .add_edge(&a.id, &b.id, EdgeType::RelatedTo, EdgeDraft::default())
            .unwrap();
        graph
            .add_edge(&b.id, &c.id, EdgeType::RelatedTo, EdgeDraft::default())
            .unwrap();

        let one_hop = graph.get_subgraph(&a.id, 1);
        assert_eq!(one_hop.nodes.len(), 2);
        assert_eq!(one_hop.edges.len(), 1);

        let two_hops = graph.get_subgraph(&a.id, 2);
        assert_eq!(two_hops.nodes.len(), 3);
        assert_eq!(two_hops.edges.len(), 2);
    }

    // ===== Maintenance =====

    #[test]
    fn test_apply_decay_floors_at_minimum() {
        let mut graph = MemoryGraph::new();
        graph.add_node(NodeType::Topic, "x", NodeDraft::default());
        for _ in 0..200 {
            graph.apply_decay(0.01);
        }
        let node = graph.query(&QueryCriteria::default()).pop().unwrap();
        assert!((node.decay - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_prune_spares_young_nodes() {
        let mut graph = MemoryGraph::new();
        graph.add_node(NodeType::Topic, "fresh", NodeDraft::default());
        let removed = graph.prune(0.99, Duration::days(7));
        assert_eq!(removed, 0);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_prune_removes_stale_low_relevance_nodes() {
        let mut graph = MemoryGraph::new();
        let node = graph.add_node(NodeType::Topic, "stale", NodeDraft::default());
        {
            let n = graph.nodes.get_mut(&node.id).unwrap();
            n.metadata.created_at = Utc::now() - Duration::days(30);
            n.decay = 0.1;
        }
        let removed = graph.prune(0.2, Duration::days(7));
        assert_eq!(removed, 1);
        assert_eq!(graph.node_count(), 0);
    }

    // ===== Sessions =====

    #[test]
    fn test_single_active_session_invariant() {
        let mut graph = MemoryGraph::new();
        let first = graph.start_session(SessionDraft {
            platform: "chatgpt".into(),
            ..Default::default()
        });
        let second = graph.start_session(SessionDraft {
            platform: "claude".into(),
            ..Default::default()
        });

        assert_ne!(first.id, second.id);
        let ended = graph.get_session(&first.id).unwrap();
        assert!(!ended.is_active);
        assert!(ended.ended_at.is_some());
        assert_eq!(graph.active_session().unwrap().id, second.id);
    }

    #[test]
    fn test_recent_sessions_sorted_desc() {
        let mut graph = MemoryGraph::new();
        graph.start_session(SessionDraft::default());
        graph.start_session(SessionDraft::default());
        let third = graph.start_session(SessionDraft::default());

        let recent = graph.get_recent_sessions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, third.id);
    }

    #[test]
    fn test_new_node_attached_to_active_session() {
        let mut graph = MemoryGraph::new();
        let session = graph.start_session(SessionDraft::default());
        let node = graph.add_node(NodeType::Goal, "ship it", NodeDraft::default());
        assert_eq!(node.session_id.as_deref(), Some(session.id.as_str()));
        assert!(graph
            .active_session()
            .unwrap()
            .node_ids
            .contains(&node.id));
    }

    // ===== Snapshot round-trip (graph law 4) =====

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let (mut graph, a, b) = graph_with_pair();
        graph
            .add_edge(&b, &a, EdgeType::PartOf, EdgeDraft::default())
            .unwrap();
        graph.start_session(SessionDraft {
            platform: "chatgpt".into(),
            ..Default::default()
        });

        let snapshot = graph.snapshot();
        let mut restored = MemoryGraph::new();
        restored.restore(snapshot.clone());

        assert_eq!(restored.node_count(), graph.node_count());
        assert_eq!(restored.edge_count(), graph.edge_count());
        assert_eq!(
            restored.active_session().map(|s| s.id.clone()),
            graph.active_session().map(|s| s.id.clone())
        );
        // Adjacency survives: the part_of edge is reachable from b.
        assert_eq!(restored.get_subgraph(&b, 1).edges.len(), 1);
        // Dedup index survives: re-adding python touches, not duplicates.
        let again = restored.add_node(NodeType::Language, "python", NodeDraft::default());
        assert_eq!(again.id, a);
        assert_eq!(restored.node_count(), graph.node_count());
    }

    // ===== Events =====

    #[test]
    fn test_mutations_emit_events_and_remote_applies_do_not() {
        let mut graph = MemoryGraph::new();
        let mut rx = graph.subscribe();

        let node = graph.add_node(NodeType::Topic, "events", NodeDraft::default());
        assert!(matches!(rx.try_recv(), Ok(GraphEvent::NodeAdded(_))));

        let mut remote = node.clone();
        remote.id = "remote-1".into();
        remote.content = "remote content".into();
        graph.apply_remote_node(remote);
        assert!(rx.try_recv().is_err());
    }

    // ===== Remote conflict resolution =====

    #[test]
    fn test_apply_remote_node_newer_wins() {
        let mut graph = MemoryGraph::new();
        let node = graph.add_node(NodeType::Topic, "conflict", NodeDraft::default());

        let mut older = graph.get_node(&node.id).unwrap().clone();
        older.content = "stale".into();
        older.metadata.updated_at = older.metadata.updated_at - Duration::hours(1);
        assert!(!graph.apply_remote_node(older));
        assert_eq!(graph.get_node(&node.id).unwrap().content, "conflict");

        let mut newer = graph.get_node(&node.id).unwrap().clone();
        newer.content = "fresh".into();
        newer.metadata.updated_at = Utc::now() + Duration::seconds(5);
        assert!(graph.apply_remote_node(newer));
        assert_eq!(graph.get_node(&node.id).unwrap().content, "fresh");
    }

    #[test]
    fn test_apply_remote_edge_add_once() {
        let (mut graph, a, b) = graph_with_pair();
        let local = graph
            .add_edge(&b, &a, EdgeType::PartOf, EdgeDraft::default())
            .unwrap();

        // Same semantic edge from a peer under a different id: skipped.
        let mut remote = local.clone();
        remote.id = "peer-edge".into();
        assert!(!graph.apply_remote_edge(remote));
        assert_eq!(graph.edge_count(), 1);
    }
}
