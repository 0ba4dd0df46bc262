//! Per-tab assembly of the whole engine.
//!
//! One `MemoryCore` value owns the graph, stores, sync agent, dispatcher,
//! runner, and router. There is no process-wide mutable state; embedders
//! construct one core per tab and plumb it through.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::graph::MemoryGraph;
use crate::host::{AllowAllHost, HostEnvironment};
use crate::router::Router;
use crate::runner::Runner;
use crate::settings::SettingsManager;
use crate::store::MemoryStore;
use crate::sync::{BroadcastTransport, GraphSync, InMemoryBroadcast, SyncConfig};
use crate::telemetry::{self, TelemetryConfig};
use crate::webhook::dispatcher::{Deliverer, HttpDeliverer};
use crate::webhook::WebhookDispatcher;

const ALARM_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);
const MAINTENANCE_PERIOD: std::time::Duration = std::time::Duration::from_secs(3600);

/// Construction options; every field has a sensible default.
pub struct CoreOptions {
    /// Database path; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Stable tab identifier; random when absent.
    pub tab_id: Option<String>,
    pub transport: Option<Arc<dyn BroadcastTransport>>,
    pub host: Option<Arc<dyn HostEnvironment>>,
    pub deliverer: Option<Arc<dyn Deliverer>>,
    pub sync: SyncConfig,
    /// When set, installs the global tracing subscriber with this shape.
    /// Hosts that configure logging themselves leave it `None`.
    pub telemetry: Option<TelemetryConfig>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            db_path: None,
            tab_id: None,
            transport: None,
            host: None,
            deliverer: None,
            sync: SyncConfig::default(),
            telemetry: None,
        }
    }
}

pub struct MemoryCore {
    pub graph: Arc<RwLock<MemoryGraph>>,
    pub store: Arc<MemoryStore>,
    pub settings: Arc<SettingsManager>,
    pub runner: Runner,
    pub sync: Arc<GraphSync>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub router: Router,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MemoryCore {
    /// Build a core. A storage failure degrades to an in-memory backend:
    /// the system keeps working, it just stops persisting.
    pub async fn new(options: CoreOptions) -> anyhow::Result<Self> {
        if let Some(config) = &options.telemetry {
            telemetry::init(config);
        }

        let store = match &options.db_path {
            Some(path) => match MemoryStore::new(path) {
                Ok(store) => store,
                Err(e) => {
                    warn!(
                        "store initialization failed ({}); continuing non-persistent",
                        e
                    );
                    MemoryStore::new_in_memory()?
                }
            },
            None => MemoryStore::new_in_memory()?,
        };
        let store = Arc::new(store);

        let settings = Arc::new(SettingsManager::load(store.kv.clone()).await);

        let mut graph = MemoryGraph::new();
        match store.graph.load_graph().await {
            Ok(Some(snapshot)) => {
                info!(
                    nodes = snapshot.nodes.len(),
                    edges = snapshot.edges.len(),
                    "restoring persisted graph"
                );
                graph.restore(snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!("persisted graph unreadable, starting empty: {}", e),
        }
        let graph = Arc::new(RwLock::new(graph));

        let transport: Arc<dyn BroadcastTransport> = options
            .transport
            .unwrap_or_else(|| Arc::new(InMemoryBroadcast::default()));
        let host: Arc<dyn HostEnvironment> =
            options.host.unwrap_or_else(|| Arc::new(AllowAllHost));
        let deliverer: Arc<dyn Deliverer> = options
            .deliverer
            .unwrap_or_else(|| Arc::new(HttpDeliverer::default()));

        let sync = Arc::new(match options.tab_id {
            Some(tab_id) => GraphSync::with_tab_id(
                tab_id,
                Arc::clone(&graph),
                Arc::clone(&transport),
                Some(store.graph.clone()),
                options.sync,
            ),
            None => GraphSync::new(
                Arc::clone(&graph),
                Arc::clone(&transport),
                Some(store.graph.clone()),
            ),
        });

        let dispatcher = Arc::new(WebhookDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            deliverer,
            Arc::clone(&host),
        ));

        let runner = Runner::new(
            Arc::clone(&settings),
            Arc::clone(&graph),
            Arc::clone(&store),
        );

        let router = Router::new(
            Arc::clone(&settings),
            Arc::clone(&store),
            Arc::clone(&graph),
            runner.clone(),
            Arc::clone(&dispatcher),
            host,
        );

        Ok(Self {
            graph,
            store,
            settings,
            runner,
            sync,
            dispatcher,
            router,
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Join the broadcast channel and start the periodic webhook alarm and
    /// graph maintenance loop.
    pub async fn start(&self) {
        self.sync.start().await;

        let alarm = self.dispatcher.spawn_alarm(ALARM_PERIOD);
        let graph = Arc::clone(&self.graph);
        let maintenance = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MAINTENANCE_PERIOD).await;
                let pruned = graph.write().await.maintain();
                if pruned > 0 {
                    info!(pruned, "graph maintenance pruned nodes");
                }
            }
        });

        self.background
            .lock()
            .expect("background lock")
            .extend([alarm, maintenance]);
        info!(tab = self.sync.tab_id(), leader = self.sync.is_leader(), "core started");
    }

    /// Graceful shutdown: release leadership and stop background work.
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
        for handle in self.background.lock().expect("background lock").drain(..) {
            handle.abort();
        }
    }
}
