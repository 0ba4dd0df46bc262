//! Cross-tab graph synchronization.
//!
//! Each tab broadcasts its graph mutations and elects a single leader that
//! owns persistence. Conflict resolution is newer-wins on record
//! timestamps; a fresh tab catches up through an addressed full sync.

pub mod messages;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::graph::{GraphEvent, MemoryGraph};
use crate::store::{GraphStore, ScheduledSaver};

pub use messages::{SyncBody, SyncMessage};
pub use transport::{BroadcastTransport, InMemoryBroadcast};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long an election waits for a sitting leader to answer.
    pub election_settle: std::time::Duration,
    pub heartbeat_interval: std::time::Duration,
    /// Silence threshold after which a follower starts a takeover.
    pub leader_timeout: std::time::Duration,
    /// Leader-side debounce between the last broadcast and the store write.
    pub persist_debounce: std::time::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            election_settle: std::time::Duration::from_millis(200),
            heartbeat_interval: std::time::Duration::from_secs(5),
            leader_timeout: std::time::Duration::from_secs(15),
            persist_debounce: std::time::Duration::from_secs(1),
        }
    }
}

struct SyncShared {
    tab_id: String,
    graph: Arc<RwLock<MemoryGraph>>,
    transport: Arc<dyn BroadcastTransport>,
    /// Debounced store writer; present only when this tab can persist.
    saver: Option<ScheduledSaver>,
    config: SyncConfig,

    is_leader: AtomicBool,
    electing: AtomicBool,
    saw_leader: AtomicBool,
    leader_id: StdMutex<Option<String>>,
    leader_seen: StdMutex<Option<Instant>>,
    last_heartbeat: StdMutex<Option<Instant>>,
    /// Peer tab id -> last message time (unix ms); diagnostic surface.
    peers: DashMap<String, i64>,
}

impl SyncShared {
    fn post(&self, body: SyncBody) {
        if let Err(e) = self
            .transport
            .post(SyncMessage::broadcast(&self.tab_id, body))
        {
            // Message loss is tolerated; full sync reconciles later.
            warn!("broadcast failed: {}", e);
        }
    }

    fn post_to(&self, target: &str, body: SyncBody) {
        if let Err(e) = self
            .transport
            .post(SyncMessage::addressed(&self.tab_id, target, body))
        {
            warn!("addressed broadcast failed: {}", e);
        }
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn adopt(&self, leader: &str) {
        *self.leader_id.lock().expect("leader_id lock") = Some(leader.to_string());
        *self.leader_seen.lock().expect("leader_seen lock") = Some(Instant::now());
        self.saw_leader.store(true, Ordering::SeqCst);
    }

    fn become_leader(&self) {
        self.is_leader.store(true, Ordering::SeqCst);
        *self.leader_id.lock().expect("leader_id lock") = Some(self.tab_id.clone());
        *self.last_heartbeat.lock().expect("last_heartbeat lock") = Some(Instant::now());
        info!(tab = %self.tab_id, "claimed sync leadership");
    }

    fn yield_leadership(&self, to: &str) {
        self.is_leader.store(false, Ordering::SeqCst);
        self.adopt(to);
        info!(tab = %self.tab_id, leader = %to, "yielding sync leadership");
    }

    /// Broadcast a query, wait out the settle window, and claim if nothing
    /// answered.
    async fn elect(self: &Arc<Self>) {
        if self.electing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.saw_leader.store(false, Ordering::SeqCst);
        self.post(SyncBody::LeaderQuery);
        tokio::time::sleep(self.config.election_settle).await;

        if self.saw_leader.load(Ordering::SeqCst) {
            debug!(tab = %self.tab_id, "adopted existing leader");
        } else {
            self.become_leader();
            self.post(SyncBody::LeaderClaim);
        }
        self.electing.store(false, Ordering::SeqCst);
    }

    /// A sitting leader made itself known (heartbeat or announce).
    fn observe_leader(&self, sender: &str) {
        if self.is_leader() {
            if sender < self.tab_id.as_str() {
                self.yield_leadership(sender);
            } else {
                // Reassert; the peer yields on our claim.
                self.post(SyncBody::LeaderClaim);
            }
        } else {
            self.adopt(sender);
        }
    }

    /// Competing claim: lexicographically smaller tab id wins.
    fn on_claim(&self, sender: &str) {
        if self.is_leader() {
            if sender < self.tab_id.as_str() {
                self.yield_leadership(sender);
            } else {
                self.post(SyncBody::LeaderAnnounce);
            }
        } else {
            self.adopt(sender);
        }
    }

    async fn handle(self: &Arc<Self>, msg: SyncMessage) {
        if msg.tab_id == self.tab_id {
            return;
        }
        self.peers
            .insert(msg.tab_id.clone(), Utc::now().timestamp_millis());
        if let Some(target) = &msg.target_tab_id {
            if target != &self.tab_id {
                return;
            }
        }

        match msg.body {
            SyncBody::NodeAdded { node } | SyncBody::NodeUpdated { node } => {
                let applied = self.graph.write().await.apply_remote_node(node);
                if applied {
                    self.persist_if_leader();
                }
            }
            SyncBody::NodeRemoved { node_id } => {
                self.graph.write().await.apply_remote_node_removal(&node_id);
                self.persist_if_leader();
            }
            SyncBody::EdgeAdded { edge } => {
                let applied = self.graph.write().await.apply_remote_edge(edge);
                if applied {
                    self.persist_if_leader();
                }
            }
            SyncBody::EdgeRemoved { edge_id } => {
                self.graph.write().await.apply_remote_edge_removal(&edge_id);
                self.persist_if_leader();
            }
            SyncBody::SessionStarted { session } => {
                self.graph.write().await.apply_remote_session_started(session);
                self.persist_if_leader();
            }
            SyncBody::SessionEnded {
                session_id,
                ended_at,
            } => {
                self.graph
                    .write()
                    .await
                    .apply_remote_session_ended(&session_id, ended_at);
                self.persist_if_leader();
            }
            SyncBody::RequestFullSync => {
                if self.is_leader() {
                    let snapshot = self.graph.read().await.snapshot();
                    debug!(to = %msg.tab_id, nodes = snapshot.nodes.len(), "serving full sync");
                    self.post_to(&msg.tab_id, SyncBody::FullSyncResponse { snapshot });
                }
            }
            SyncBody::FullSyncResponse { snapshot } => {
                let mut graph = self.graph.write().await;
                if snapshot.stats.last_modified > graph.stats().last_modified {
                    info!(
                        nodes = snapshot.nodes.len(),
                        edges = snapshot.edges.len(),
                        "applying full sync snapshot"
                    );
                    graph.restore(snapshot);
                } else {
                    debug!("full sync snapshot not newer, ignored");
                }
            }
            SyncBody::Heartbeat | SyncBody::LeaderAnnounce => {
                self.observe_leader(&msg.tab_id);
            }
            SyncBody::LeaderClaim => {
                self.on_claim(&msg.tab_id);
            }
            SyncBody::LeaderQuery => {
                if self.is_leader() {
                    self.post(SyncBody::LeaderAnnounce);
                }
            }
            SyncBody::LeaderRelease => {
                let released_ours = self
                    .leader_id
                    .lock()
                    .expect("leader_id lock")
                    .as_deref()
                    == Some(msg.tab_id.as_str());
                if released_ours {
                    *self.leader_id.lock().expect("leader_id lock") = None;
                    *self.leader_seen.lock().expect("leader_seen lock") = None;
                    let shared = Arc::clone(self);
                    tokio::spawn(async move { shared.elect().await });
                }
            }
        }
    }

    /// Map a local mutation to its broadcast and, on the leader, schedule
    /// the debounced store write.
    fn on_local_event(self: &Arc<Self>, event: GraphEvent) {
        let body = match event {
            GraphEvent::NodeAdded(node) => SyncBody::NodeAdded { node },
            GraphEvent::NodeUpdated(node) => SyncBody::NodeUpdated { node },
            GraphEvent::NodeRemoved { node_id } => SyncBody::NodeRemoved { node_id },
            GraphEvent::EdgeAdded(edge) => SyncBody::EdgeAdded { edge },
            GraphEvent::EdgeRemoved { edge_id } => SyncBody::EdgeRemoved { edge_id },
            GraphEvent::SessionStarted(session) => SyncBody::SessionStarted { session },
            GraphEvent::SessionEnded {
                session_id,
                ended_at,
            } => SyncBody::SessionEnded {
                session_id,
                ended_at,
            },
        };
        self.post(body);
        self.persist_if_leader();
    }

    fn persist_if_leader(self: &Arc<Self>) {
        if !self.is_leader() {
            return;
        }
        if let Some(saver) = &self.saver {
            saver.schedule();
        }
    }

    /// One-second maintenance tick: leader heartbeats, follower takeover.
    async fn tick(self: &Arc<Self>) {
        if self.is_leader() {
            let due = self
                .last_heartbeat
                .lock()
                .expect("last_heartbeat lock")
                .map_or(true, |at| at.elapsed() >= self.config.heartbeat_interval);
            if due {
                self.post(SyncBody::Heartbeat);
                *self.last_heartbeat.lock().expect("last_heartbeat lock") = Some(Instant::now());
            }
            return;
        }

        let stale = match *self.leader_seen.lock().expect("leader_seen lock") {
            Some(seen) => seen.elapsed() > self.config.leader_timeout,
            None => true,
        };
        if stale {
            warn!(tab = %self.tab_id, "leader silent, starting takeover election");
            self.elect().await;
        }
    }
}

/// Per-tab sync agent. Construct, then `start()`.
pub struct GraphSync {
    shared: Arc<SyncShared>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GraphSync {
    pub fn new(
        graph: Arc<RwLock<MemoryGraph>>,
        transport: Arc<dyn BroadcastTransport>,
        store: Option<GraphStore>,
    ) -> Self {
        Self::with_tab_id(
            Uuid::new_v4().to_string(),
            graph,
            transport,
            store,
            SyncConfig::default(),
        )
    }

    pub fn with_tab_id(
        tab_id: String,
        graph: Arc<RwLock<MemoryGraph>>,
        transport: Arc<dyn BroadcastTransport>,
        store: Option<GraphStore>,
        config: SyncConfig,
    ) -> Self {
        let saver = store.map(|graph_store| {
            ScheduledSaver::with_delay(Arc::clone(&graph), graph_store, config.persist_debounce)
        });
        Self {
            shared: Arc::new(SyncShared {
                tab_id,
                graph,
                transport,
                saver,
                config,
                is_leader: AtomicBool::new(false),
                electing: AtomicBool::new(false),
                saw_leader: AtomicBool::new(false),
                leader_id: StdMutex::new(None),
                leader_seen: StdMutex::new(None),
                last_heartbeat: StdMutex::new(None),
                peers: DashMap::new(),
            }),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.shared.tab_id
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader()
    }

    pub fn leader_id(&self) -> Option<String> {
        self.shared.leader_id.lock().expect("leader_id lock").clone()
    }

    /// Peer tab ids seen on the channel, with last-heard unix ms.
    pub fn peers(&self) -> Vec<(String, i64)> {
        self.shared
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Subscribe to the transport, run the election, and begin the
    /// heartbeat/takeover loop. Non-leaders request a full sync.
    pub async fn start(&self) {
        let mut handles = Vec::new();

        let shared = Arc::clone(&self.shared);
        let mut rx = self.shared.transport.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => shared.handle(msg).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync listener lagged, messages dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let shared = Arc::clone(&self.shared);
        let mut events = self.shared.graph.write().await.subscribe();
        handles.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.on_local_event(event);
            }
        }));

        self.shared.elect().await;

        let shared = Arc::clone(&self.shared);
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                shared.tick().await;
            }
        }));

        if !self.shared.is_leader() {
            self.shared.post(SyncBody::RequestFullSync);
        }

        self.tasks.lock().expect("tasks lock").extend(handles);
    }

    /// Graceful shutdown: a leader releases leadership and flushes the
    /// pending write.
    pub async fn shutdown(&self) {
        if self.shared.is_leader() {
            self.shared.post(SyncBody::LeaderRelease);
            if let Some(saver) = &self.shared.saver {
                if let Err(e) = saver.flush().await {
                    warn!("final persist on shutdown failed: {}", e);
                }
            }
            self.shared.is_leader.store(false, Ordering::SeqCst);
        }
        self.abort();
    }

    /// Hard stop without a release broadcast (a crashed tab, in tests).
    pub fn abort(&self) {
        for handle in self.tasks.lock().expect("tasks lock").drain(..) {
            handle.abort();
        }
    }
}

impl Drop for GraphSync {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeDraft, NodeType};
    use crate::store::MemoryStore;

    fn make_sync(
        tab_id: &str,
        transport: &InMemoryBroadcast,
        store: Option<GraphStore>,
    ) -> (GraphSync, Arc<RwLock<MemoryGraph>>) {
        let graph = Arc::new(RwLock::new(MemoryGraph::new()));
        let sync = GraphSync::with_tab_id(
            tab_id.to_string(),
            Arc::clone(&graph),
            Arc::new(transport.clone()),
            store,
            SyncConfig::default(),
        );
        (sync, graph)
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            settle(10).await;
        }
        false
    }

    // ===== Election =====

    #[tokio::test(start_paused = true)]
    async fn test_lone_tab_claims_leadership() {
        let transport = InMemoryBroadcast::default();
        let (sync, _graph) = make_sync("tab-a", &transport, None);
        sync.start().await;
        assert!(sync.is_leader());
        assert_eq!(sync.leader_id().as_deref(), Some("tab-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tab_adopts_sitting_leader() {
        let transport = InMemoryBroadcast::default();
        let (first, _g1) = make_sync("aaa-first", &transport, None);
        first.start().await;
        assert!(first.is_leader());

        // Greater tab id enters later and yields.
        let (second, _g2) = make_sync("zzz-second", &transport, None);
        second.start().await;
        settle(50).await;

        assert!(!second.is_leader());
        assert_eq!(second.leader_id().as_deref(), Some("aaa-first"));
        assert!(first.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_claims_resolve_to_smaller_tab_id() {
        let transport = InMemoryBroadcast::default();
        let (a, _ga) = make_sync("aaa", &transport, None);
        let (b, _gb) = make_sync("bbb", &transport, None);

        // Start both elections concurrently so neither answers the other's
        // query in time and both claim.
        tokio::join!(a.start(), b.start());
        assert!(
            wait_until(|| a.is_leader() != b.is_leader()).await,
            "exactly one leader should remain"
        );
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(b.leader_id().as_deref(), Some("aaa"));
    }

    // ===== Mutation broadcast (property 13) =====

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_mutations_converge() {
        let transport = InMemoryBroadcast::default();
        let (a, graph_a) = make_sync("aaa", &transport, None);
        let (b, graph_b) = make_sync("zzz", &transport, None);
        a.start().await;
        b.start().await;

        graph_a
            .write()
            .await
            .add_node(NodeType::Language, "python", NodeDraft::default());
        graph_b
            .write()
            .await
            .add_node(NodeType::Language, "rust", NodeDraft::default());

        let ga = Arc::clone(&graph_a);
        let gb = Arc::clone(&graph_b);
        assert!(
            wait_until(move || {
                ga.try_read().map(|g| g.node_count() == 2).unwrap_or(false)
                    && gb.try_read().map(|g| g.node_count() == 2).unwrap_or(false)
            })
            .await,
            "both tabs should converge to two nodes"
        );

        let mut ids_a: Vec<String> = graph_a
            .read()
            .await
            .snapshot()
            .nodes
            .iter()
            .map(|n| n.id.clone())
            .collect();
        let mut ids_b: Vec<String> = graph_b
            .read()
            .await
            .snapshot()
            .nodes
            .iter()
            .map(|n| n.id.clone())
            .collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_removal_propagates() {
        let transport = InMemoryBroadcast::default();
        let (a, graph_a) = make_sync("aaa", &transport, None);
        let (b, graph_b) = make_sync("zzz", &transport, None);
        a.start().await;
        b.start().await;

        let node = graph_a
            .write()
            .await
            .add_node(NodeType::Topic, "doomed", NodeDraft::default());
        let gb = Arc::clone(&graph_b);
        assert!(wait_until(move || gb
            .try_read()
            .map(|g| g.node_count() == 1)
            .unwrap_or(false))
        .await);

        graph_a.write().await.remove_node(&node.id);
        let gb = Arc::clone(&graph_b);
        assert!(wait_until(move || gb
            .try_read()
            .map(|g| g.node_count() == 0)
            .unwrap_or(false))
        .await);
    }

    // ===== Full sync (property 15, E5) =====

    #[tokio::test(start_paused = true)]
    async fn test_fresh_peer_receives_full_sync() {
        let transport = InMemoryBroadcast::default();
        let (leader, graph_leader) = make_sync("aaa", &transport, None);
        // Seed before start: these mutations are never broadcast live.
        {
            let mut g = graph_leader.write().await;
            let lang = g.add_node(NodeType::Language, "python", NodeDraft::default());
            let fw = g.add_node(NodeType::Framework, "django", NodeDraft::default());
            g.add_edge(
                &fw.id,
                &lang.id,
                crate::graph::EdgeType::PartOf,
                crate::graph::EdgeDraft::default(),
            );
        }
        leader.start().await;
        assert!(leader.is_leader());

        let (follower, graph_follower) = make_sync("zzz", &transport, None);
        follower.start().await;
        assert!(!follower.is_leader());

        let gf = Arc::clone(&graph_follower);
        assert!(
            wait_until(move || {
                gf.try_read()
                    .map(|g| g.node_count() == 2 && g.edge_count() == 1)
                    .unwrap_or(false)
            })
            .await,
            "follower should receive the leader's snapshot"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_ignored_when_not_newer() {
        let transport = InMemoryBroadcast::default();
        let (leader, _graph_leader) = make_sync("aaa", &transport, None);
        leader.start().await;

        // Follower with its own newer local state keeps it.
        let (follower, graph_follower) = make_sync("zzz", &transport, None);
        graph_follower
            .write()
            .await
            .add_node(NodeType::Topic, "local work", NodeDraft::default());
        follower.start().await;
        settle(500).await;

        let graph = graph_follower.read().await;
        assert_eq!(graph.node_count(), 1);
        assert_eq!(
            graph.snapshot().nodes[0].content,
            "local work"
        );
    }

    // ===== Leader failure (property 14) =====

    #[tokio::test(start_paused = true)]
    async fn test_takeover_after_leader_death() {
        let transport = InMemoryBroadcast::default();
        let (leader, _gl) = make_sync("aaa-leader", &transport, None);
        leader.start().await;
        let (f1, _g1) = make_sync("mmm-follower", &transport, None);
        let (f2, _g2) = make_sync("nnn-follower", &transport, None);
        f1.start().await;
        f2.start().await;
        assert!(!f1.is_leader() && !f2.is_leader());

        // Crash the leader: no release broadcast, heartbeats stop.
        leader.abort();

        assert!(
            wait_until(|| f1.is_leader() || f2.is_leader()).await,
            "a follower should take over"
        );
        assert!(
            wait_until(|| f1.is_leader() != f2.is_leader()).await,
            "exactly one follower should hold leadership"
        );
        // Survivors agree on who leads.
        let leader_id = if f1.is_leader() { f1.tab_id() } else { f2.tab_id() };
        assert!(
            wait_until(|| {
                f1.leader_id().as_deref() == Some(leader_id)
                    && f2.leader_id().as_deref() == Some(leader_id)
            })
            .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_release_triggers_immediate_reelection() {
        let transport = InMemoryBroadcast::default();
        let (leader, _gl) = make_sync("aaa-leader", &transport, None);
        leader.start().await;
        let (follower, _gf) = make_sync("zzz-follower", &transport, None);
        follower.start().await;
        assert!(!follower.is_leader());

        leader.shutdown().await;

        assert!(
            wait_until(|| follower.is_leader()).await,
            "follower should win the post-release election"
        );
    }

    // ===== Leader-only persistence =====

    #[tokio::test(start_paused = true)]
    async fn test_only_leader_persists() {
        let transport = InMemoryBroadcast::default();
        let leader_store = MemoryStore::new_in_memory().unwrap();
        let follower_store = MemoryStore::new_in_memory().unwrap();

        let (leader, _gl) = make_sync("aaa", &transport, Some(leader_store.graph.clone()));
        leader.start().await;
        let (follower, graph_follower) =
            make_sync("zzz", &transport, Some(follower_store.graph.clone()));
        follower.start().await;

        // A follower-side mutation flows to the leader, which persists it.
        graph_follower
            .write()
            .await
            .add_node(NodeType::Topic, "persist me", NodeDraft::default());
        settle(3_000).await;

        let persisted = leader_store.graph.load_graph().await.unwrap();
        assert!(persisted.is_some());
        assert_eq!(persisted.unwrap().nodes.len(), 1);

        let follower_side = follower_store.graph.load_graph().await.unwrap();
        assert!(follower_side.is_none(), "followers never write the store");
    }
}
