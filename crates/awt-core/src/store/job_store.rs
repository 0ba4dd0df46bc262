//! Durable job queue document `{by_id, order}`, newest first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::kv::KvStore;
use crate::webhook::types::Job;

const JOBS_KEY: &str = "jobs";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobIndex {
    pub by_id: HashMap<String, Job>,
    /// Job ids, newest first.
    pub order: Vec<String>,
}

pub struct JobStore {
    kv: KvStore,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    async fn load_index(&self) -> anyhow::Result<JobIndex> {
        Ok(self
            .kv
            .get::<JobIndex>(JOBS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn persist_index(&self, index: &JobIndex) -> anyhow::Result<()> {
        self.kv.put(JOBS_KEY, index).await
    }

    pub async fn enqueue(&self, job: Job) -> anyhow::Result<Job> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        index.order.retain(|id| id != &job.id);
        index.order.insert(0, job.id.clone());
        index.by_id.insert(job.id.clone(), job.clone());
        self.persist_index(&index).await?;
        debug!(id = %job.id, connector = %job.connector_id, "job enqueued");
        Ok(job)
    }

    pub async fn update(&self, job: &Job) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        index.by_id.insert(job.id.clone(), job.clone());
        if !index.order.iter().any(|id| id == &job.id) {
            index.order.insert(0, job.id.clone());
        }
        self.persist_index(&index).await
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Job>> {
        Ok(self.load_index().await?.by_id.get(id).cloned())
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let index = self.load_index().await?;
        Ok(index
            .order
            .iter()
            .filter_map(|id| index.by_id.get(id).cloned())
            .collect())
    }

    /// All jobs, oldest first (the pump's scan order).
    pub async fn oldest_first(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.list().await?;
        jobs.reverse();
        Ok(jobs)
    }

    pub async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.load_index().await?.order.len())
    }
}
