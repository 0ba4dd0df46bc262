//! Wire envelope and payloads for cross-tab graph synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{Edge, GraphSnapshot, Node, Session};

/// Message payloads. Wire `type` values are snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncBody {
    NodeAdded { node: Node },
    NodeUpdated { node: Node },
    NodeRemoved { node_id: String },
    EdgeAdded { edge: Edge },
    EdgeRemoved { edge_id: String },
    SessionStarted { session: Session },
    SessionEnded {
        session_id: String,
        ended_at: DateTime<Utc>,
    },
    RequestFullSync,
    FullSyncResponse { snapshot: GraphSnapshot },
    Heartbeat,
    LeaderClaim,
    LeaderRelease,
    LeaderQuery,
    LeaderAnnounce,
}

impl SyncBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncBody::NodeAdded { .. } => "node_added",
            SyncBody::NodeUpdated { .. } => "node_updated",
            SyncBody::NodeRemoved { .. } => "node_removed",
            SyncBody::EdgeAdded { .. } => "edge_added",
            SyncBody::EdgeRemoved { .. } => "edge_removed",
            SyncBody::SessionStarted { .. } => "session_started",
            SyncBody::SessionEnded { .. } => "session_ended",
            SyncBody::RequestFullSync => "request_full_sync",
            SyncBody::FullSyncResponse { .. } => "full_sync_response",
            SyncBody::Heartbeat => "heartbeat",
            SyncBody::LeaderClaim => "leader_claim",
            SyncBody::LeaderRelease => "leader_release",
            SyncBody::LeaderQuery => "leader_query",
            SyncBody::LeaderAnnounce => "leader_announce",
        }
    }
}

/// The broadcast envelope. `target_tab_id` addresses one peer; everyone
/// else drops the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub tab_id: String,
    /// Send time, unix milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tab_id: Option<String>,
    #[serde(flatten)]
    pub body: SyncBody,
}

impl SyncMessage {
    pub fn broadcast(tab_id: &str, body: SyncBody) -> Self {
        Self {
            tab_id: tab_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            target_tab_id: None,
            body,
        }
    }

    pub fn addressed(tab_id: &str, target_tab_id: &str, body: SyncBody) -> Self {
        Self {
            tab_id: tab_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            target_tab_id: Some(target_tab_id.to_string()),
            body,
        }
    }
}
