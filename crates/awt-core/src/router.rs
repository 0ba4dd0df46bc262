//! Typed command surface.
//!
//! Peers (popup, options page, context menu, shortcuts) send
//! `{type, ...}` requests; every response is `{ok, ...}` with stable error
//! kinds on failure. The transport that carries these messages is an
//! external collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::graph::MemoryGraph;
use crate::host::HostEnvironment;
use crate::runner::{Runner, RunnerError};
use crate::settings::SettingsManager;
use crate::store::{ConversationStore, MemoryStore, MetaPatch, SearchQuery};
use crate::webhook::types::ConnectorSet;
use crate::webhook::WebhookDispatcher;

/// The full request surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // Settings
    GetSettings,
    ResetSettings,
    SetTheme {
        theme: String,
    },
    SetDefaultExportFormat {
        format: String,
    },
    ToggleGlobal,
    SetScriptEnabled {
        script_id: String,
        enabled: bool,
    },
    GetEnabledForUrl {
        url: String,
    },
    // Downloads / stats
    DownloadText {
        filename: String,
        text: String,
        #[serde(default)]
        mime: String,
    },
    // Conversations
    SaveConversation {
        conversation: crate::store::conversation_store::ConversationDraft,
    },
    ListConversations {
        #[serde(flatten)]
        params: SearchQuery,
    },
    GetConversationById {
        id: String,
    },
    GetConversationIdForUrl {
        url: String,
    },
    DeleteConversation {
        id: String,
    },
    UpdateConversationMeta {
        id: String,
        patch: MetaPatch,
    },
    GetGlobalNotes,
    SetGlobalNotes {
        text: String,
    },
    // Connectors / jobs
    GetConnectors,
    SetConnectors {
        connectors: ConnectorSet,
    },
    ConnectorSend {
        connector_id: String,
        payload: Value,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        kind: String,
    },
    ListJobs,
    // Content-side
    RunNow,
    ExportCurrent {
        #[serde(default)]
        format: Option<String>,
    },
    SaveCurrent {
        #[serde(default)]
        autosave: bool,
    },
    CopyCurrent {
        #[serde(default)]
        format: Option<String>,
    },
    InvokeScriptAction {
        script_id: String,
        action: String,
        #[serde(default)]
        payload: Value,
    },
}

fn ok(mut extra: serde_json::Map<String, Value>) -> Value {
    extra.insert("ok".into(), json!(true));
    Value::Object(extra)
}

fn ok_with(key: &str, value: Value) -> Value {
    json!({ "ok": true, key: value })
}

fn err(kind: &str) -> Value {
    json!({ "ok": false, "error": kind })
}

pub struct Router {
    settings: Arc<SettingsManager>,
    store: Arc<MemoryStore>,
    graph: Arc<RwLock<MemoryGraph>>,
    runner: Runner,
    dispatcher: Arc<WebhookDispatcher>,
    host: Arc<dyn HostEnvironment>,
}

impl Router {
    pub fn new(
        settings: Arc<SettingsManager>,
        store: Arc<MemoryStore>,
        graph: Arc<RwLock<MemoryGraph>>,
        runner: Runner,
        dispatcher: Arc<WebhookDispatcher>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            settings,
            store,
            graph,
            runner,
            dispatcher,
            host,
        }
    }

    /// Entry point for raw JSON requests. Undecodable input maps to the
    /// `invalid_json` kind.
    pub async fn handle_json(&self, raw: Value) -> Value {
        match serde_json::from_value::<Command>(raw) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!("undecodable command: {}", e);
                err("invalid_json")
            }
        }
    }

    pub async fn handle(&self, command: Command) -> Value {
        match command {
            Command::GetSettings => self.get_settings().await,
            Command::ResetSettings => match self.settings.reset().await {
                Ok(settings) => ok_with("settings", json!(settings.as_ref())),
                Err(e) => err(&e.to_string()),
            },
            Command::SetTheme { theme } => {
                self.update_settings(move |s| s.ui.theme = theme).await
            }
            Command::SetDefaultExportFormat { format } => {
                self.update_settings(move |s| s.ui.default_export_format = format)
                    .await
            }
            Command::ToggleGlobal => {
                match self
                    .settings
                    .update(|s| s.global_enabled = !s.global_enabled)
                    .await
                {
                    Ok(settings) => ok_with("global_enabled", json!(settings.global_enabled)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::SetScriptEnabled { script_id, enabled } => {
                self.update_settings(move |s| {
                    s.enabled.insert(script_id, enabled);
                })
                .await
            }
            Command::GetEnabledForUrl { url } => {
                let settings = self.settings.get();
                let ids: Vec<String> = settings
                    .enabled_for_url(&url)
                    .iter()
                    .map(|e| e.id.clone())
                    .collect();
                ok_with("enabled_scripts", json!(ids))
            }

            Command::DownloadText {
                filename,
                text,
                mime,
            } => {
                let mime = if mime.is_empty() {
                    "text/plain".to_string()
                } else {
                    mime
                };
                match self.host.download_text(&filename, &text, &mime) {
                    Ok(()) => {
                        let _ = self.settings.bump_stat("exports").await;
                        ok(Default::default())
                    }
                    Err(e) => {
                        warn!("download refused: {}", e);
                        err("missing_permission")
                    }
                }
            }

            Command::SaveConversation { conversation } => {
                match self.store.conversations.save(conversation).await {
                    Ok(saved) => {
                        let _ = self.settings.bump_stat("saves").await;
                        ok_with("conversation", json!(saved))
                    }
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::ListConversations { params } => {
                match self.store.conversations.search(&params).await {
                    Ok(items) => ok_with("items", json!(items)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::GetConversationById { id } => {
                match self.store.conversations.get(&id).await {
                    Ok(conversation) => ok_with("conversation", json!(conversation)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::GetConversationIdForUrl { url } => {
                match self.store.conversations.id_for_url(&url).await {
                    Ok(id) => ok_with("id", json!(id)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::DeleteConversation { id } => {
                match self.store.conversations.delete(&id).await {
                    Ok(deleted) => ok_with("deleted", json!(deleted)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::UpdateConversationMeta { id, patch } => {
                match self.store.conversations.update_meta(&id, patch).await {
                    Ok(conversation) => ok_with("conversation", json!(conversation)),
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::GetGlobalNotes => match self.store.conversations.global_notes().await {
                Ok(text) => ok_with("text", json!(text)),
                Err(e) => err(&e.to_string()),
            },
            Command::SetGlobalNotes { text } => {
                match self.store.conversations.set_global_notes(&text).await {
                    Ok(()) => ok(Default::default()),
                    Err(e) => err(&e.to_string()),
                }
            }

            Command::GetConnectors => {
                ok_with("connectors", json!(self.settings.get().connectors))
            }
            Command::SetConnectors { connectors } => {
                self.update_settings(move |s| s.connectors = connectors).await
            }
            Command::ConnectorSend {
                connector_id,
                payload,
                headers,
                kind,
            } => {
                let kind = if kind.is_empty() {
                    "manual".to_string()
                } else {
                    kind
                };
                match self
                    .dispatcher
                    .enqueue(&connector_id, payload, headers, &kind)
                    .await
                {
                    Ok(job) => {
                        info!(job = %job.id, status = %job.status, "connector send queued");
                        match job.status {
                            crate::webhook::JobStatus::Failed => {
                                self.host.notify(&format!("Webhook failed: {}", job.error))
                            }
                            crate::webhook::JobStatus::Done => {
                                self.host.notify("Webhook delivered")
                            }
                            _ => {}
                        }
                        ok_with("job", json!(job))
                    }
                    Err(e) => err(&e.to_string()),
                }
            }
            Command::ListJobs => match self.store.jobs.list().await {
                Ok(jobs) => ok_with("jobs", json!(jobs)),
                Err(e) => err(&e.to_string()),
            },

            Command::RunNow => {
                let url = self.runner.current_url();
                if url.is_empty() {
                    return err("no_active_tab");
                }
                let ran = self.runner.run_now(&url).await;
                ok_with("ran", json!(ran))
            }
            Command::ExportCurrent { format } => {
                let format = format
                    .unwrap_or_else(|| self.settings.get().ui.default_export_format.clone());
                match self.runner.export_current(&format) {
                    Ok((filename, text, mime)) => {
                        match self.host.download_text(&filename, &text, &mime) {
                            Ok(()) => {
                                let _ = self.settings.bump_stat("exports").await;
                                self.host.notify(&format!("Exported {}", filename));
                                ok_with("filename", json!(filename))
                            }
                            Err(e) => {
                                warn!("export download refused: {}", e);
                                self.host.notify("Export failed: permission denied");
                                err("missing_permission")
                            }
                        }
                    }
                    Err(e) => err(&runner_error_kind(&e)),
                }
            }
            Command::SaveCurrent { autosave } => match self.runner.save_current(autosave).await {
                Ok(conversation) => {
                    let _ = self.settings.bump_stat("saves").await;
                    if !autosave {
                        self.host.notify("Conversation saved");
                    }
                    ok_with("conversation", json!(conversation))
                }
                Err(e) => err(&runner_error_kind(&e)),
            },
            Command::CopyCurrent { format } => {
                let format = format
                    .unwrap_or_else(|| self.settings.get().ui.default_export_format.clone());
                match self.runner.copy_current(&format) {
                    Ok(text) => ok_with("text", json!(text)),
                    Err(e) => err(&runner_error_kind(&e)),
                }
            }
            Command::InvokeScriptAction {
                script_id,
                action,
                payload,
            } => match self.runner.invoke_action(&script_id, &action, &payload).await {
                Ok(result) => ok_with("result", json!(result)),
                Err(e) => err(&runner_error_kind(&e)),
            },
        }
    }

    async fn get_settings(&self) -> Value {
        let settings = self.settings.get();
        let usage = self.settings.stats();
        let graph = self.graph.read().await;
        let graph_stats = graph.stats();
        let type_counts = graph.type_counts();
        drop(graph);
        let store_stats = self.store.stats().await.unwrap_or_default();

        json!({
            "ok": true,
            "settings": settings.as_ref(),
            "stats": {
                "usage": usage.as_ref(),
                "graph": {
                    "nodes": graph_stats.node_count,
                    "edges": graph_stats.edge_count,
                    "sessions": graph_stats.session_count,
                    "last_modified": graph_stats.last_modified,
                    "by_node_type": type_counts.by_node_type,
                },
                "store": store_stats,
            },
        })
    }

    async fn update_settings<F>(&self, mutate: F) -> Value
    where
        F: FnOnce(&mut crate::settings::Settings),
    {
        match self.settings.update(mutate).await {
            Ok(_) => ok(Default::default()),
            Err(e) => err(&e.to_string()),
        }
    }

    /// Access for callers that bypass the command surface.
    pub fn conversations(&self) -> &ConversationStore {
        &self.store.conversations
    }
}

fn runner_error_kind(error: &RunnerError) -> String {
    error.to_string()
}
