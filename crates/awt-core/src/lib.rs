//! awt-core - Offline memory and automation core for the assistant web
//! toolkit: semantic memory graph, pattern extraction, context generation,
//! cross-tab sync, conversation store, and a durable webhook queue.

pub mod capture;
pub mod context_engine;
pub mod core;
pub mod extractor;
pub mod graph;
pub mod host;
pub mod router;
pub mod runner;
pub mod settings;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;
pub mod webhook;

// Public API exports
pub use crate::core::{CoreOptions, MemoryCore};
pub use capture::CapturedConversation;
pub use context_engine::{ContextGenerator, ContextPayload, ContextStrategy};
pub use extractor::{ExtractionReport, Extractor, PatternLibrary};
pub use graph::{Edge, EdgeType, GraphSnapshot, MemoryGraph, Node, NodeType, QueryCriteria, Session};
pub use host::{AllowAllHost, HostEnvironment};
pub use router::{Command, Router};
pub use runner::{Runner, ScriptContext, ScriptModule};
pub use settings::{Settings, SettingsManager};
pub use store::{Conversation, MemoryStore, SearchQuery};
pub use sync::{BroadcastTransport, GraphSync, InMemoryBroadcast};
pub use telemetry::{LogFormat, TelemetryConfig};
pub use webhook::{Connector, Job, JobStatus, WebhookDispatcher};
