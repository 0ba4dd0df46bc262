//! Script runner: executes the enabled scripts for the active URL,
//! debounces route changes and conversation mutations, and owns the
//! session lifecycle.
//!
//! Script failures are caught and logged, never propagated; the page must
//! keep working when one module misbehaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::capture::{joined_text, normalize_capture, platform_for_url, CapturedConversation};
use crate::context_engine::{map_to_variables, ContextGenerator, ContextStrategy};
use crate::extractor::{ExtractionContext, Extractor};
use crate::graph::{MemoryGraph, SessionDraft};
use crate::settings::SettingsManager;
use crate::store::MemoryStore;

const ROUTE_DEBOUNCE_MS: u64 = 250;
const CAPTURE_DEBOUNCE_MS: u64 = 1000;

/// Everything a script sees on one run.
#[derive(Clone)]
pub struct ScriptContext {
    pub url: String,
    pub platform: String,
    pub capture: Option<CapturedConversation>,
    pub graph: Arc<RwLock<MemoryGraph>>,
    pub store: Arc<MemoryStore>,
    pub settings: Arc<SettingsManager>,
}

/// A runnable counterpart of a settings-registry entry.
#[async_trait]
pub trait ScriptModule: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: &ScriptContext) -> anyhow::Result<()>;

    /// Whether this script exposes any actions at all.
    fn supports_actions(&self) -> bool {
        false
    }

    /// Handle a named action. `None` means the action name is unknown.
    async fn handle_action(
        &self,
        _action: &str,
        _payload: &Value,
        _ctx: &ScriptContext,
    ) -> Option<anyhow::Result<Value>> {
        None
    }
}

/// Provider of the current DOM capture; the content layer implements this.
pub trait ConversationSource: Send + Sync {
    fn capture(&self) -> Option<CapturedConversation>;
}

/// One step of a workflow chain. Only the first step of a chain executes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainStep {
    pub script_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Runner invocation failures with stable wire kinds.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("script_not_enabled")]
    ScriptNotEnabled,
    #[error("no_action_handler")]
    NoActionHandler,
    #[error("unknown_action")]
    UnknownAction,
    #[error("no_active_tab")]
    NoActiveTab,
    #[error("{0}")]
    Failed(String),
}

struct RunnerInner {
    settings: Arc<SettingsManager>,
    graph: Arc<RwLock<MemoryGraph>>,
    store: Arc<MemoryStore>,
    scripts: StdRwLock<Vec<Arc<dyn ScriptModule>>>,
    source: StdRwLock<Option<Arc<dyn ConversationSource>>>,
    current_url: StdRwLock<String>,
    route_generation: AtomicU64,
    capture_generation: AtomicU64,
}

#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(
        settings: Arc<SettingsManager>,
        graph: Arc<RwLock<MemoryGraph>>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let runner = Self {
            inner: Arc::new(RunnerInner {
                settings,
                graph,
                store,
                scripts: StdRwLock::new(Vec::new()),
                source: StdRwLock::new(None),
                current_url: StdRwLock::new(String::new()),
                route_generation: AtomicU64::new(0),
                capture_generation: AtomicU64::new(0),
            }),
        };
        runner.register_script(Arc::new(MemoryScript::new()));
        runner.register_script(Arc::new(AutosaveScript));
        runner
    }

    pub fn register_script(&self, script: Arc<dyn ScriptModule>) {
        self.inner
            .scripts
            .write()
            .expect("scripts lock")
            .push(script);
    }

    pub fn set_source(&self, source: Arc<dyn ConversationSource>) {
        *self.inner.source.write().expect("source lock") = Some(source);
    }

    pub fn current_url(&self) -> String {
        self.inner.current_url.read().expect("url lock").clone()
    }

    fn build_context(&self, url: &str) -> ScriptContext {
        let capture = self
            .inner
            .source
            .read()
            .expect("source lock")
            .as_ref()
            .and_then(|s| s.capture());
        ScriptContext {
            url: url.to_string(),
            platform: platform_for_url(url),
            capture,
            graph: Arc::clone(&self.inner.graph),
            store: Arc::clone(&self.inner.store),
            settings: Arc::clone(&self.inner.settings),
        }
    }

    /// Route change: session bookkeeping now, script re-run after a 250 ms
    /// debounce.
    pub async fn route_changed(&self, url: &str) {
        let changed = {
            let mut current = self.inner.current_url.write().expect("url lock");
            if *current == url {
                false
            } else {
                *current = url.to_string();
                true
            }
        };
        if changed {
            let platform = platform_for_url(url);
            let mut graph = self.inner.graph.write().await;
            graph.start_session(SessionDraft {
                platform,
                url: url.to_string(),
                ..Default::default()
            });
            info!(url, "route changed, session rotated");
        }

        let generation = self.inner.route_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let runner = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(ROUTE_DEBOUNCE_MS)).await;
            if runner.inner.route_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            runner.run_now(&url).await;
        });
    }

    /// Conversation DOM mutated: re-run enabled scripts after a 1 s
    /// debounce so typing bursts coalesce.
    pub fn conversation_mutated(&self) {
        let generation = self
            .inner
            .capture_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let runner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(CAPTURE_DEBOUNCE_MS)).await;
            if runner.inner.capture_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let url = runner.current_url();
            runner.run_now(&url).await;
        });
    }

    /// Execute every enabled script for `url` immediately. Returns the ids
    /// that ran; individual failures are logged and swallowed.
    pub async fn run_now(&self, url: &str) -> Vec<String> {
        let settings = self.inner.settings.get();
        let enabled_ids: Vec<String> = settings
            .enabled_for_url(url)
            .iter()
            .map(|entry| entry.id.clone())
            .collect();
        if enabled_ids.is_empty() {
            return Vec::new();
        }

        let ctx = self.build_context(url);
        let scripts: Vec<Arc<dyn ScriptModule>> = self
            .inner
            .scripts
            .read()
            .expect("scripts lock")
            .iter()
            .filter(|s| enabled_ids.iter().any(|id| id == s.id()))
            .cloned()
            .collect();

        let mut ran = Vec::new();
        for script in scripts {
            match script.run(&ctx).await {
                Ok(()) => {
                    debug!(script = script.id(), url, "script ran");
                    ran.push(script.id().to_string());
                }
                Err(e) => warn!(script = script.id(), "script run failed: {}", e),
            }
        }
        ran
    }

    /// Route an action to a script. Errors mirror the router's wire kinds.
    pub async fn invoke_action(
        &self,
        script_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<Value, RunnerError> {
        let settings = self.inner.settings.get();
        if !settings.global_enabled || !settings.enabled.get(script_id).copied().unwrap_or(false) {
            return Err(RunnerError::ScriptNotEnabled);
        }

        let script = self
            .inner
            .scripts
            .read()
            .expect("scripts lock")
            .iter()
            .find(|s| s.id() == script_id)
            .cloned()
            .ok_or(RunnerError::ScriptNotEnabled)?;

        if !script.supports_actions() {
            return Err(RunnerError::NoActionHandler);
        }

        let ctx = self.build_context(&self.current_url());
        match script.handle_action(action, payload, &ctx).await {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(RunnerError::Failed(e.to_string())),
            None => Err(RunnerError::UnknownAction),
        }
    }

    /// Execute a workflow chain. Only the first step runs; multi-step
    /// execution is intentionally not wired.
    pub async fn run_chain(&self, steps: &[ChainStep]) -> Result<Value, RunnerError> {
        let Some(first) = steps.first() else {
            return Ok(Value::Null);
        };
        self.invoke_action(&first.script_id, &first.action, &first.payload)
            .await
    }

    // ===== Content-side commands =====

    fn require_capture(&self) -> Result<CapturedConversation, RunnerError> {
        self.inner
            .source
            .read()
            .expect("source lock")
            .as_ref()
            .and_then(|s| s.capture())
            .ok_or(RunnerError::NoActiveTab)
    }

    /// Save the current capture. Autosaves stay silent; explicit saves
    /// surface errors to the caller.
    pub async fn save_current(&self, autosave: bool) -> Result<crate::store::Conversation, RunnerError> {
        let capture = self.require_capture()?;
        let draft = normalize_capture(&capture);
        let saved = self
            .inner
            .store
            .conversations
            .save(draft)
            .await
            .map_err(|e| RunnerError::Failed(e.to_string()));
        match (&saved, autosave) {
            (Err(e), true) => {
                warn!("autosave failed silently: {}", e);
            }
            _ => {}
        }
        saved
    }

    /// Render the current capture for export. Returns (filename, text, mime).
    pub fn export_current(&self, format: &str) -> Result<(String, String, String), RunnerError> {
        let capture = self.require_capture()?;
        let (text, mime, ext) = render_conversation(&capture, format);
        let stem = if capture.title.is_empty() {
            "conversation".to_string()
        } else {
            capture
                .title
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect::<String>()
                .to_lowercase()
        };
        Ok((format!("{}.{}", stem, ext), text, mime))
    }

    /// Render the current capture for the clipboard.
    pub fn copy_current(&self, format: &str) -> Result<String, RunnerError> {
        let capture = self.require_capture()?;
        Ok(render_conversation(&capture, format).0)
    }
}

fn render_conversation(capture: &CapturedConversation, format: &str) -> (String, String, String) {
    match format {
        "json" => (
            serde_json::to_string_pretty(capture).unwrap_or_default(),
            "application/json".to_string(),
            "json".to_string(),
        ),
        "text" => (
            joined_text(&capture.messages),
            "text/plain".to_string(),
            "txt".to_string(),
        ),
        _ => {
            let mut out = String::new();
            if !capture.title.is_empty() {
                out.push_str(&format!("# {}\n\n", capture.title));
            }
            for message in &capture.messages {
                out.push_str(&format!("**{}**\n\n{}\n\n", message.role, message.text));
            }
            (out, "text/markdown".to_string(), "md".to_string())
        }
    }
}

// ===== Built-in scripts =====

/// Feeds the capture through the extractor into the memory graph and
/// exposes context-generation actions.
pub struct MemoryScript {
    extractor: Extractor,
}

impl MemoryScript {
    pub fn new() -> Self {
        Self {
            extractor: Extractor::new(),
        }
    }
}

impl Default for MemoryScript {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptModule for MemoryScript {
    fn id(&self) -> &str {
        "chat-memory"
    }

    async fn run(&self, ctx: &ScriptContext) -> anyhow::Result<()> {
        let Some(capture) = &ctx.capture else {
            return Ok(());
        };
        let text = joined_text(&capture.messages);
        let mut graph = ctx.graph.write().await;
        let session_id = graph.active_session().map(|s| s.id.clone());
        self.extractor.extract(
            &mut graph,
            &text,
            &ExtractionContext {
                platform: Some(ctx.platform.clone()),
                session_id,
            },
        );
        if let Some(session) = graph.active_session_mut() {
            session.prompt_count = capture
                .messages
                .iter()
                .filter(|m| m.role.eq_ignore_ascii_case("user"))
                .count() as u32;
            session.response_count = capture
                .messages
                .iter()
                .filter(|m| m.role.eq_ignore_ascii_case("assistant"))
                .count() as u32;
        }
        Ok(())
    }

    fn supports_actions(&self) -> bool {
        true
    }

    async fn handle_action(
        &self,
        action: &str,
        payload: &Value,
        ctx: &ScriptContext,
    ) -> Option<anyhow::Result<Value>> {
        match action {
            "get_context" => {
                let platform = payload
                    .get("platform")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&ctx.platform)
                    .to_string();
                let strategy = match payload.get("strategy").and_then(|v| v.as_str()) {
                    Some("minimal") => ContextStrategy::Minimal,
                    Some("narrative") => ContextStrategy::Narrative,
                    Some("system") => ContextStrategy::System,
                    Some("custom") => ContextStrategy::Custom(
                        payload
                            .get("template")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    ),
                    _ => ContextStrategy::Structured,
                };
                let graph = ctx.graph.read().await;
                let context = ContextGenerator::generate(&graph, &platform, &strategy);
                Some(serde_json::to_value(context).map_err(Into::into))
            }
            "map_variables" => {
                let names: Vec<String> = payload
                    .get("names")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let graph = ctx.graph.read().await;
                let bindings = map_to_variables(&graph, &names);
                Some(serde_json::to_value(bindings).map_err(Into::into))
            }
            _ => None,
        }
    }
}

/// Persists the capture to the conversation store on every run.
pub struct AutosaveScript;

#[async_trait]
impl ScriptModule for AutosaveScript {
    fn id(&self) -> &str {
        "conversation-autosave"
    }

    async fn run(&self, ctx: &ScriptContext) -> anyhow::Result<()> {
        let Some(capture) = &ctx.capture else {
            return Ok(());
        };
        if capture.messages.is_empty() {
            return Ok(());
        }
        let draft = normalize_capture(capture);
        ctx.store.conversations.save(draft).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeType, QueryCriteria};
    use crate::store::ConversationMessage;

    struct StaticSource {
        capture: CapturedConversation,
    }

    impl ConversationSource for StaticSource {
        fn capture(&self) -> Option<CapturedConversation> {
            Some(self.capture.clone())
        }
    }

    async fn make_runner() -> (Runner, Arc<RwLock<MemoryGraph>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new_in_memory().unwrap());
        let settings = Arc::new(SettingsManager::load(store.kv.clone()).await);
        let graph = Arc::new(RwLock::new(MemoryGraph::new()));
        let runner = Runner::new(settings, Arc::clone(&graph), Arc::clone(&store));
        (runner, graph, store)
    }

    fn sample_capture() -> CapturedConversation {
        CapturedConversation {
            url: "https://chatgpt.com/c/abc".into(),
            title: "Django help".into(),
            messages: vec![
                ConversationMessage {
                    role: "user".into(),
                    text: "I'm using Python with Django to build a REST API.".into(),
                },
                ConversationMessage {
                    role: "assistant".into(),
                    text: "Check your views; that TypeError: bad operand comes from the serializer."
                        .into(),
                },
            ],
            ts: Some(1_700_000_000_000),
        }
    }

    // ===== run_now =====

    #[tokio::test]
    async fn test_run_now_extracts_and_autosaves() {
        let (runner, graph, store) = make_runner().await;
        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));
        runner.route_changed("https://chatgpt.com/c/abc").await;

        let ran = runner.run_now("https://chatgpt.com/c/abc").await;
        assert!(ran.contains(&"chat-memory".to_string()));
        assert!(ran.contains(&"conversation-autosave".to_string()));

        let graph = graph.read().await;
        assert!(!graph
            .query(&QueryCriteria::of_type(NodeType::Language))
            .is_empty());
        let session = graph.active_session().unwrap();
        assert_eq!(session.prompt_count, 1);
        assert_eq!(session.response_count, 1);
        assert_eq!(session.platform, "chatgpt");
        drop(graph);

        let saved = store.conversations.get("c_abc").await.unwrap().unwrap();
        assert_eq!(saved.title, "Django help");
    }

    #[tokio::test]
    async fn test_run_now_skips_non_matching_url() {
        let (runner, graph, _store) = make_runner().await;
        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));
        let ran = runner.run_now("https://example.com/not-a-chat").await;
        assert!(ran.is_empty());
        assert_eq!(graph.read().await.node_count(), 0);
    }

    // ===== Sessions =====

    #[tokio::test]
    async fn test_route_change_rotates_session() {
        let (runner, graph, _store) = make_runner().await;
        runner.route_changed("https://chatgpt.com/c/one").await;
        let first = graph.read().await.active_session().unwrap().id.clone();

        runner.route_changed("https://claude.ai/chat/two").await;
        let graph = graph.read().await;
        let active = graph.active_session().unwrap();
        assert_ne!(active.id, first);
        assert_eq!(active.platform, "claude");
        let old = graph.get_session(&first).unwrap();
        assert!(!old.is_active);
    }

    // ===== Debounce =====

    #[tokio::test]
    async fn test_conversation_mutation_debounce_coalesces() {
        let (runner, graph, _store) = make_runner().await;
        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));
        runner.route_changed("https://chatgpt.com/c/abc").await;
        // Let the route-change debounce run out first.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        let baseline = graph.read().await.node_count();

        for _ in 0..5 {
            runner.conversation_mutated();
        }
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        // Same capture re-extracted once: dedup means no node growth.
        assert_eq!(graph.read().await.node_count(), baseline);
        let session = graph.read().await.active_session().unwrap().clone();
        // Counters are set from the capture, not accumulated across runs.
        assert_eq!(session.prompt_count, 1);
    }

    // ===== Actions =====

    #[tokio::test]
    async fn test_invoke_action_errors() {
        let (runner, _graph, _store) = make_runner().await;

        // context-autofill exists in the registry but is disabled by default.
        let err = runner
            .invoke_action("context-autofill", "anything", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "script_not_enabled");

        let err = runner
            .invoke_action("conversation-autosave", "anything", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no_action_handler");

        let err = runner
            .invoke_action("chat-memory", "not-an-action", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown_action");
    }

    #[tokio::test]
    async fn test_get_context_action_returns_payload() {
        let (runner, _graph, _store) = make_runner().await;
        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));
        runner.route_changed("https://chatgpt.com/c/abc").await;
        runner.run_now("https://chatgpt.com/c/abc").await;

        let value = runner
            .invoke_action(
                "chat-memory",
                "get_context",
                &serde_json::json!({ "strategy": "structured" }),
            )
            .await
            .unwrap();
        assert_eq!(value["strategy"], "structured");
        assert!(value["tokens"].as_u64().is_some());
    }

    // ===== Chains =====

    #[tokio::test]
    async fn test_chain_runs_only_first_step() {
        let (runner, _graph, _store) = make_runner().await;
        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));
        runner.route_changed("https://chatgpt.com/c/abc").await;
        runner.run_now("https://chatgpt.com/c/abc").await;

        let steps = vec![
            ChainStep {
                script_id: "chat-memory".into(),
                action: "get_context".into(),
                payload: serde_json::json!({ "strategy": "minimal" }),
            },
            ChainStep {
                script_id: "chat-memory".into(),
                action: "not-an-action".into(),
                payload: Value::Null,
            },
        ];
        // The bogus second step never runs, so the chain succeeds.
        let value = runner.run_chain(&steps).await.unwrap();
        assert_eq!(value["strategy"], "minimal");

        assert_eq!(runner.run_chain(&[]).await.unwrap(), Value::Null);
    }

    // ===== Exports =====

    #[tokio::test]
    async fn test_export_and_copy_current() {
        let (runner, _graph, _store) = make_runner().await;
        assert_eq!(
            runner.export_current("markdown").unwrap_err().to_string(),
            "no_active_tab"
        );

        runner.set_source(Arc::new(StaticSource {
            capture: sample_capture(),
        }));

        let (filename, text, mime) = runner.export_current("markdown").unwrap();
        assert!(filename.ends_with(".md"));
        assert_eq!(mime, "text/markdown");
        assert!(text.contains("# Django help"));

        let json_text = runner.copy_current("json").unwrap();
        let parsed: CapturedConversation = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed.title, "Django help");

        let plain = runner.copy_current("text").unwrap();
        assert!(plain.starts_with("[USER]\n"));
    }
}
