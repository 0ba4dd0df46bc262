//! Connector and job records for the webhook dispatcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-configured webhook destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Connectors as stored in settings: records by id plus display order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorSet {
    #[serde(default)]
    pub by_id: HashMap<String, Connector>,
    #[serde(default)]
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: u16,
}

/// A queued, retryable unit of webhook delivery work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub connector_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub kind: String,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest next attempt, unix milliseconds.
    #[serde(default)]
    pub next_run_at: Option<i64>,
    #[serde(default)]
    pub last_response: Option<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(
        connector_id: &str,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
        kind: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: "webhook".to_string(),
            connector_id: connector_id.to_string(),
            payload,
            headers,
            kind: kind.to_string(),
            status: JobStatus::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_response: None,
            error: String::new(),
            result: None,
        }
    }
}

/// Delivery failures with stable wire kinds.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing_connector")]
    MissingConnector,

    #[error("connector_disabled")]
    ConnectorDisabled,

    #[error("missing_host_permission")]
    MissingHostPermission { origin: String },

    #[error("invalid_url")]
    InvalidUrl,

    #[error("http_{0}")]
    Http(u16),

    #[error("{0}")]
    Network(String),
}
