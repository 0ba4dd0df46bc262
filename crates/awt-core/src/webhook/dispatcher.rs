//! The webhook pump: resolves connectors, signs and posts job payloads,
//! and schedules retries with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::host::HostEnvironment;
use crate::settings::SettingsManager;
use crate::store::MemoryStore;
use crate::utils::TextUtils;
use crate::webhook::types::{Connector, Job, JobResult, JobStatus, WebhookError};

const MAX_ATTEMPTS: u32 = 5;
const MAX_JOBS_PER_PUMP: usize = 3;
const BACKOFF_STEP_MS: i64 = 60_000;
const BACKOFF_CAP_MS: i64 = 600_000;
const RESPONSE_CAPTURE_CHARS: usize = 2000;

pub const HEADER_TIMESTAMP: &str = "X-AWT-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-AWT-Signature";

/// One outbound POST, fully prepared.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP seam: the real client in production, a scripted double in tests.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse, String>;
}

/// reqwest-backed deliverer; redirects are followed by the client's
/// default policy.
pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl Default for HttpDeliverer {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse, String> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(DeliveryResponse { status, body })
    }
}

/// Lowercase-hex HMAC-SHA-256 over `"<ts>.<body>"`.
pub fn sign(secret: &str, timestamp_ms: i64, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct WebhookDispatcher {
    store: Arc<MemoryStore>,
    settings: Arc<SettingsManager>,
    deliverer: Arc<dyn Deliverer>,
    host: Arc<dyn HostEnvironment>,
    pump_lock: Mutex<()>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<MemoryStore>,
        settings: Arc<SettingsManager>,
        deliverer: Arc<dyn Deliverer>,
        host: Arc<dyn HostEnvironment>,
    ) -> Self {
        Self {
            store,
            settings,
            deliverer,
            host,
            pump_lock: Mutex::new(()),
        }
    }

    /// Queue a job at the head of the order and pump opportunistically.
    pub async fn enqueue(
        &self,
        connector_id: &str,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
        kind: &str,
    ) -> anyhow::Result<Job> {
        let job = Job::new(connector_id, payload, headers, kind);
        let id = job.id.clone();
        self.store.jobs.enqueue(job).await?;
        self.pump().await?;
        Ok(self
            .store
            .jobs
            .get(&id)
            .await?
            .expect("job persisted by enqueue"))
    }

    /// Advance at most three due jobs, oldest first. Triggered by the
    /// periodic alarm and immediately after every enqueue.
    pub async fn pump(&self) -> anyhow::Result<usize> {
        let _guard = self.pump_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let mut processed = 0;

        for job in self.store.jobs.oldest_first().await? {
            if processed >= MAX_JOBS_PER_PUMP {
                break;
            }
            if job.status != JobStatus::Queued {
                continue;
            }
            if job.next_run_at.is_some_and(|at| at > now_ms) {
                continue;
            }
            self.advance(job).await?;
            processed += 1;
        }
        if processed > 0 {
            debug!(processed, "webhook pump advanced jobs");
        }
        Ok(processed)
    }

    async fn advance(&self, mut job: Job) -> anyhow::Result<()> {
        let connector = match self.resolve_connector(&job) {
            Ok(connector) => connector,
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = e.to_string();
                job.updated_at = Utc::now();
                warn!(id = %job.id, error = %job.error, "job failed preflight");
                self.store.jobs.update(&job).await?;
                return Ok(());
            }
        };

        job.status = JobStatus::Running;
        job.attempts += 1;
        job.updated_at = Utc::now();
        self.store.jobs.update(&job).await?;

        let request = build_request(&connector, &job);
        match self.deliverer.deliver(request).await {
            Ok(response) if (200..300).contains(&response.status) => {
                job.status = JobStatus::Done;
                job.error = String::new();
                job.result = Some(JobResult {
                    status: response.status,
                });
                job.last_response =
                    Some(TextUtils::truncate_hard(&response.body, RESPONSE_CAPTURE_CHARS).into_owned());
                job.updated_at = Utc::now();
                info!(id = %job.id, status = response.status, "webhook delivered");
            }
            Ok(response) => {
                self.record_failure(
                    &mut job,
                    WebhookError::Http(response.status).to_string(),
                    Some(response.body),
                );
            }
            Err(network_error) => {
                self.record_failure(&mut job, network_error, None);
            }
        }
        self.store.jobs.update(&job).await?;
        Ok(())
    }

    fn resolve_connector(&self, job: &Job) -> Result<Connector, WebhookError> {
        let connector = self
            .settings
            .connector(&job.connector_id)
            .ok_or(WebhookError::MissingConnector)?;
        if !connector.enabled {
            return Err(WebhookError::ConnectorDisabled);
        }
        if connector.url.trim().is_empty() {
            return Err(WebhookError::MissingConnector);
        }
        let parsed = url::Url::parse(&connector.url).map_err(|_| WebhookError::InvalidUrl)?;
        let origin_pattern = format!("{}/*", parsed.origin().ascii_serialization());
        if !self.host.has_host_permission(&origin_pattern) {
            return Err(WebhookError::MissingHostPermission {
                origin: origin_pattern,
            });
        }
        Ok(connector)
    }

    fn record_failure(&self, job: &mut Job, error: String, response_body: Option<String>) {
        let backoff = (BACKOFF_STEP_MS * job.attempts as i64).min(BACKOFF_CAP_MS);
        job.next_run_at = Some(Utc::now().timestamp_millis() + backoff);
        job.status = if job.attempts >= MAX_ATTEMPTS {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        };
        job.error = error;
        if let Some(body) = response_body {
            job.last_response =
                Some(TextUtils::truncate_hard(&body, RESPONSE_CAPTURE_CHARS).into_owned());
        }
        job.updated_at = Utc::now();
        warn!(
            id = %job.id,
            attempts = job.attempts,
            backoff_ms = backoff,
            error = %job.error,
            "webhook attempt failed"
        );
    }

    /// Periodic alarm driving the pump.
    pub fn spawn_alarm(self: &Arc<Self>, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.pump().await {
                    warn!("alarm pump failed: {}", e);
                }
            }
        })
    }
}

fn build_request(connector: &Connector, job: &Job) -> DeliveryRequest {
    let body = match &job.payload {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };

    let mut headers: Vec<(String, String)> =
        vec![("Content-Type".to_string(), "application/json".to_string())];
    for (name, value) in &connector.headers {
        headers.push((name.clone(), value.clone()));
    }
    for (name, value) in &job.headers {
        headers.push((name.clone(), value.clone()));
    }

    if let Some(secret) = connector.secret.as_deref().filter(|s| !s.is_empty()) {
        let ts = Utc::now().timestamp_millis();
        let signature = sign(secret, ts, &body);
        headers.push((HEADER_TIMESTAMP.to_string(), ts.to_string()));
        headers.push((HEADER_SIGNATURE.to_string(), format!("sha256={}", signature)));
    }

    DeliveryRequest {
        url: connector.url.clone(),
        headers,
        body,
    }
}
