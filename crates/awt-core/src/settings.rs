//! Persisted settings document: script registry, per-script enablement,
//! connectors, UI preferences, and usage stats.
//!
//! Loaded through a defaults merge (union registry by id, union the maps,
//! preserve connectors, preserve an explicit global kill-switch) and served
//! read-mostly through an `ArcSwap`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::kv::KvStore;
use crate::webhook::types::{Connector, ConnectorSet};

const SETTINGS_KEY: &str = "settings";
const STATS_KEY: &str = "stats";
pub const SETTINGS_VERSION: u32 = 3;

/// One installed script description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRegistryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    /// URL patterns: exact, or `<prefix>/*`.
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub run_at: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub default_enabled: bool,
    #[serde(default)]
    pub default_options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSettings {
    pub theme: String,
    pub default_export_format: String,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: "system".into(),
            default_export_format: "markdown".into(),
        }
    }
}

/// The single persisted settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default = "default_true")]
    pub global_enabled: bool,
    #[serde(default)]
    pub registry: Vec<ScriptRegistryEntry>,
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
    #[serde(default)]
    pub approvals: HashMap<String, HashMap<String, bool>>,
    #[serde(default)]
    pub script_options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub connectors: ConnectorSet,
    #[serde(default)]
    pub ui: UiSettings,
}

fn default_true() -> bool {
    true
}

/// Usage counters bumped by the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub exports: u64,
    #[serde(default)]
    pub saves: u64,
}

const CHAT_PLATFORM_PATTERNS: &[&str] = &[
    "https://chatgpt.com/*",
    "https://chat.openai.com/*",
    "https://claude.ai/*",
    "https://www.perplexity.ai/*",
    "https://gemini.google.com/*",
    "https://poe.com/*",
    "https://copilot.microsoft.com/*",
    "https://grok.com/*",
];

fn chat_patterns() -> Vec<String> {
    CHAT_PLATFORM_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        let registry = vec![
            ScriptRegistryEntry {
                id: "chat-memory".into(),
                name: "Chat Memory".into(),
                description: "Builds the semantic memory graph from the active chat".into(),
                icon: "brain".into(),
                matches: chat_patterns(),
                run_at: "document_idle".into(),
                permissions: vec!["storage".into()],
                entry: "memory".into(),
                default_enabled: true,
                default_options: serde_json::json!({}),
            },
            ScriptRegistryEntry {
                id: "conversation-autosave".into(),
                name: "Conversation Autosave".into(),
                description: "Captures and saves the conversation as you chat".into(),
                icon: "save".into(),
                matches: chat_patterns(),
                run_at: "document_idle".into(),
                permissions: vec!["storage".into()],
                entry: "autosave".into(),
                default_enabled: true,
                default_options: serde_json::json!({ "debounceMs": 1000 }),
            },
            ScriptRegistryEntry {
                id: "context-autofill".into(),
                name: "Context Autofill".into(),
                description: "Fills prompt template variables from the memory graph".into(),
                icon: "wand".into(),
                matches: chat_patterns(),
                run_at: "document_idle".into(),
                permissions: vec![],
                entry: "autofill".into(),
                default_enabled: false,
                default_options: serde_json::json!({}),
            },
        ];

        let mut enabled = HashMap::new();
        for entry in &registry {
            enabled.insert(entry.id.clone(), entry.default_enabled);
        }

        Self {
            version: SETTINGS_VERSION,
            global_enabled: true,
            registry,
            enabled,
            approvals: HashMap::new(),
            script_options: HashMap::new(),
            connectors: ConnectorSet::default(),
            ui: UiSettings::default(),
        }
    }
}

impl Settings {
    /// Merge a loaded document over the defaults: registry union by id,
    /// map unions, connectors preserved verbatim, and an explicit
    /// `global_enabled = false` kept.
    pub fn merged_with_defaults(loaded: Settings) -> Settings {
        let mut merged = Settings::default();

        merged.global_enabled = loaded.global_enabled;

        // Union registry by id; entries the user already has win.
        let mut registry = loaded.registry;
        for default_entry in std::mem::take(&mut merged.registry) {
            if !registry.iter().any(|e| e.id == default_entry.id) {
                registry.push(default_entry);
            }
        }
        merged.registry = registry;

        for (id, value) in loaded.enabled {
            merged.enabled.insert(id, value);
        }
        merged.approvals.extend(loaded.approvals);
        merged.script_options.extend(loaded.script_options);
        merged.connectors = loaded.connectors;
        merged.ui = loaded.ui;
        merged.version = SETTINGS_VERSION;
        merged
    }

    /// A script is enabled for a URL iff the global switch is on, the
    /// script's flag is set, and at least one pattern matches.
    pub fn script_enabled_for_url(&self, script_id: &str, url: &str) -> bool {
        if !self.global_enabled {
            return false;
        }
        if !self.enabled.get(script_id).copied().unwrap_or(false) {
            return false;
        }
        self.registry
            .iter()
            .find(|entry| entry.id == script_id)
            .is_some_and(|entry| entry.matches.iter().any(|p| url_matches(p, url)))
    }

    pub fn enabled_for_url(&self, url: &str) -> Vec<&ScriptRegistryEntry> {
        self.registry
            .iter()
            .filter(|entry| self.script_enabled_for_url(&entry.id, url))
            .collect()
    }
}

/// Exact match, or `<prefix>/*` prefix match.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        url == prefix || url.starts_with(&format!("{}/", prefix))
    } else {
        pattern == url
    }
}

/// KV-backed settings with hot read access.
pub struct SettingsManager {
    kv: KvStore,
    cached: ArcSwap<Settings>,
    stats: ArcSwap<UsageStats>,
    write_lock: Mutex<()>,
}

impl SettingsManager {
    pub async fn load(kv: KvStore) -> Self {
        let loaded = match kv.get::<Settings>(SETTINGS_KEY).await {
            Ok(Some(doc)) => Settings::merged_with_defaults(doc),
            Ok(None) => Settings::default(),
            Err(e) => {
                warn!("failed to load settings, using defaults: {}", e);
                Settings::default()
            }
        };
        let stats = kv
            .get::<UsageStats>(STATS_KEY)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        info!(
            scripts = loaded.registry.len(),
            connectors = loaded.connectors.order.len(),
            "settings loaded"
        );
        Self {
            kv,
            cached: ArcSwap::from_pointee(loaded),
            stats: ArcSwap::from_pointee(stats),
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Arc<Settings> {
        self.cached.load_full()
    }

    pub fn stats(&self) -> Arc<UsageStats> {
        self.stats.load_full()
    }

    /// Apply a mutation, persist, and swap the cache.
    pub async fn update<F>(&self, mutate: F) -> anyhow::Result<Arc<Settings>>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.cached.load_full()).clone();
        mutate(&mut next);
        self.kv.put(SETTINGS_KEY, &next).await?;
        let next = Arc::new(next);
        self.cached.store(Arc::clone(&next));
        Ok(next)
    }

    pub async fn reset(&self) -> anyhow::Result<Arc<Settings>> {
        let _guard = self.write_lock.lock().await;
        let next = Arc::new(Settings::default());
        self.kv.put(SETTINGS_KEY, next.as_ref()).await?;
        self.cached.store(Arc::clone(&next));
        Ok(next)
    }

    pub async fn bump_stat(&self, kind: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.stats.load_full()).clone();
        match kind {
            "exports" => next.exports += 1,
            "saves" => next.saves += 1,
            other => {
                warn!(kind = other, "unknown stat kind");
                return Ok(());
            }
        }
        self.kv.put(STATS_KEY, &next).await?;
        self.stats.store(Arc::new(next));
        Ok(())
    }

    pub fn connector(&self, id: &str) -> Option<Connector> {
        self.get().connectors.by_id.get(id).cloned()
    }
}
