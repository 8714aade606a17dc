//! Durable job queue on top of [`ResearchStore`].
//!
//! Claims are atomic in the store. Every state transition after a claim is
//! fenced on `locked_by`, so a worker that lost its lease cannot overwrite
//! the job; such writes report `false`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rip_core::{BackoffPolicy, JobStatus, ResearchJob};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{ResearchStore, StoreResult, StoreTx};

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_attempts: i32,
    pub lease: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn ResearchStore>,
    config: QueueConfig,
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl JobQueue {
    pub fn new(store: Arc<dyn ResearchStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
        job_type: &str,
        payload: Value,
    ) -> StoreResult<Uuid> {
        let mut tx = self.store.begin().await?;
        let id = self.enqueue_in(tx.as_mut(), tenant_id, run_id, job_type, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Enqueues inside the caller's transaction.
    pub async fn enqueue_in(
        &self,
        tx: &mut dyn StoreTx,
        tenant_id: Uuid,
        run_id: Uuid,
        job_type: &str,
        payload: Value,
    ) -> StoreResult<Uuid> {
        let job = ResearchJob::new(tenant_id, run_id, job_type, payload, self.config.max_attempts, Utc::now());
        tx.insert_job(&job).await?;
        info!(job_id = %job.id, %run_id, job_type, "job enqueued");
        Ok(job.id)
    }

    pub async fn claim_next(&self, worker_id: &str) -> StoreResult<Option<ResearchJob>> {
        self.claim_next_at(worker_id, Utc::now()).await
    }

    pub async fn claim_next_at(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<ResearchJob>> {
        let mut tx = self.store.begin().await?;
        let job = tx.claim_next_job(worker_id, now, self.config.lease).await?;
        tx.commit().await?;
        if let Some(job) = &job {
            info!(job_id = %job.id, run_id = %job.run_id, job_type = %job.job_type, worker_id, attempts = job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Loads the job and applies `change` only while `worker_id` still holds it.
    async fn transition(
        &self,
        job_id: Uuid,
        worker_id: &str,
        change: impl FnOnce(&mut ResearchJob) + Send,
    ) -> StoreResult<Option<ResearchJob>> {
        let mut tx = self.store.begin().await?;
        let Some(mut job) = tx.get_job(job_id).await? else {
            return Ok(None);
        };
        if !job.is_locked_by(worker_id) {
            warn!(%job_id, worker_id, locked_by = ?job.locked_by, status = job.status.as_str(), "stale job write ignored");
            return Ok(None);
        }
        change(&mut job);
        job.updated_at = Utc::now();
        tx.update_job(&job).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    pub async fn mark_succeeded(&self, job_id: Uuid, worker_id: &str) -> StoreResult<bool> {
        let updated = self
            .transition(job_id, worker_id, |job| {
                job.status = JobStatus::Succeeded;
                job.locked_by = None;
                job.locked_at = None;
                job.retry_at = None;
                job.last_error = None;
            })
            .await?;
        if updated.is_some() {
            info!(%job_id, worker_id, "job succeeded");
        }
        Ok(updated.is_some())
    }

    /// Consumes an attempt. Requeues with backoff until `max_attempts`, then fails permanently.
    pub async fn mark_failed(&self, job_id: Uuid, worker_id: &str, error: &str) -> StoreResult<bool> {
        let backoff = self.config.backoff;
        let now = Utc::now();
        let updated = self
            .transition(job_id, worker_id, |job| {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.locked_by = None;
                job.locked_at = None;
                if job.attempts < job.max_attempts {
                    job.status = JobStatus::Queued;
                    job.retry_at = Some(now + to_chrono(backoff.delay_after_attempts(job.attempts)));
                } else {
                    job.status = JobStatus::Failed;
                    job.retry_at = None;
                }
            })
            .await?;
        match &updated {
            Some(job) if job.status == JobStatus::Failed => {
                warn!(%job_id, attempts = job.attempts, error, "job exhausted its attempts");
            }
            Some(job) => {
                warn!(%job_id, attempts = job.attempts, retry_at = ?job.retry_at, error, "job failed, retry scheduled");
            }
            None => {}
        }
        Ok(updated.is_some())
    }

    /// Permanent failure without retry.
    pub async fn mark_dead(&self, job_id: Uuid, worker_id: &str, error: &str) -> StoreResult<bool> {
        let updated = self
            .transition(job_id, worker_id, |job| {
                job.attempts += 1;
                job.status = JobStatus::Failed;
                job.last_error = Some(error.to_string());
                job.locked_by = None;
                job.locked_at = None;
                job.retry_at = None;
            })
            .await?;
        if updated.is_some() {
            warn!(%job_id, error, "job marked dead");
        }
        Ok(updated.is_some())
    }

    /// Returns the job to the queue without consuming an attempt.
    pub async fn reschedule(&self, job_id: Uuid, worker_id: &str, retry_at: DateTime<Utc>) -> StoreResult<bool> {
        let updated = self
            .transition(job_id, worker_id, |job| {
                job.status = JobStatus::Queued;
                job.retry_at = Some(retry_at);
                job.locked_by = None;
                job.locked_at = None;
            })
            .await?;
        if updated.is_some() {
            info!(%job_id, %retry_at, "job rescheduled");
        }
        Ok(updated.is_some())
    }
}
