//! Queue worker: claims jobs and dispatches them to the pipeline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rip_core::ResearchJob;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::classify_run_sources;
use crate::{Pipeline, PipelineError, PipelineResult, JOB_INGEST_RUN, JOB_RESOLVE_CANONICAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum JobDisposition {
    Succeeded,
    /// Sources are still waiting on a fetch retry.
    Rescheduled { retry_at: DateTime<Utc> },
    /// Attempt consumed; the queue decides whether it runs again.
    Failed { error: String },
    Dead { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub job_type: String,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub disposition: JobDisposition,
}

enum Handled {
    Done,
    WaitUntil(DateTime<Utc>),
}

pub struct Worker {
    pipeline: Arc<Pipeline>,
    worker_id: String,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(pipeline: Arc<Pipeline>, worker_id: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            worker_id: worker_id.into(),
            poll_interval,
        }
    }

    /// `HOSTNAME:pid`, falling back to `worker:pid`.
    pub fn default_worker_id() -> String {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "worker".to_string());
        format!("{host}:{}", std::process::id())
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims and runs at most one job. `None` when the queue is empty.
    pub async fn run_once(&self) -> PipelineResult<Option<JobReport>> {
        let queue = self.pipeline.queue();
        let Some(job) = queue.claim_next(&self.worker_id).await? else {
            return Ok(None);
        };
        info!(job_id = %job.id, job_type = %job.job_type, run_id = %job.run_id, attempt = job.attempts + 1, "job claimed");

        let disposition = match self.handle(&job).await {
            Ok(Handled::Done) => {
                self.fenced(queue.mark_succeeded(job.id, &self.worker_id).await?, &job);
                JobDisposition::Succeeded
            }
            Ok(Handled::WaitUntil(retry_at)) => {
                self.fenced(queue.reschedule(job.id, &self.worker_id, retry_at).await?, &job);
                JobDisposition::Rescheduled { retry_at }
            }
            Err(err) if err.is_permanent() => {
                let error = err.to_string();
                self.fenced(queue.mark_dead(job.id, &self.worker_id, &error).await?, &job);
                JobDisposition::Dead { error }
            }
            Err(err) => {
                let error = err.to_string();
                error!(job_id = %job.id, error = %error, "job failed");
                self.fenced(queue.mark_failed(job.id, &self.worker_id, &error).await?, &job);
                JobDisposition::Failed { error }
            }
        };

        Ok(Some(JobReport {
            job_id: job.id,
            job_type: job.job_type.clone(),
            run_id: job.run_id,
            disposition,
        }))
    }

    /// Polls the queue until `shutdown` resolves. A job in flight is always
    /// finished before the loop exits.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(worker_id = %self.worker_id, poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    error!(error = %err, "worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            } else if (&mut shutdown).now_or_never().is_some() {
                break;
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }

    fn fenced(&self, applied: bool, job: &ResearchJob) {
        if !applied {
            warn!(job_id = %job.id, worker_id = %self.worker_id, "lease lost before the job result was recorded");
        }
    }

    async fn handle(&self, job: &ResearchJob) -> PipelineResult<Handled> {
        match job.job_type.as_str() {
            JOB_INGEST_RUN => self.handle_ingest(job).await,
            JOB_RESOLVE_CANONICAL => {
                self.pipeline.resolve(job.tenant_id, job.run_id).await?;
                Ok(Handled::Done)
            }
            other => Err(PipelineError::InvalidInput(format!("unknown_job_type:{other}"))),
        }
    }

    /// Bundle-backed jobs fail their run on any error, acquisition included.
    /// A later attempt may still ingest a failed run.
    async fn handle_ingest(&self, job: &ResearchJob) -> PipelineResult<Handled> {
        let bundle_sha256 = job.payload.get("bundle_sha256").and_then(Value::as_str);
        let handled = self.ingest_run(job, bundle_sha256).await;
        if let (Err(err), Some(bundle_sha256)) = (&handled, bundle_sha256) {
            let message = err.to_string();
            if let Err(mark_err) = self
                .pipeline
                .mark_run_failed(job.tenant_id, job.run_id, bundle_sha256, &message)
                .await
            {
                warn!(run_id = %job.run_id, error = %mark_err, "could not mark run failed");
            }
        }
        handled
    }

    async fn ingest_run(&self, job: &ResearchJob, bundle_sha256: Option<&str>) -> PipelineResult<Handled> {
        let acquisition = self.pipeline.acquire_sources(job.tenant_id, job.run_id).await?;
        if let Some(retry_at) = acquisition.waiting_until {
            info!(run_id = %job.run_id, %retry_at, "sources waiting on retry, ingestion deferred");
            return Ok(Handled::WaitUntil(retry_at));
        }

        match bundle_sha256 {
            Some(bundle_sha256) => {
                self.pipeline.ingest_stored_bundle(job, bundle_sha256).await?;
            }
            None => {
                let mut tx = self.pipeline.store().begin().await?;
                let summary =
                    classify_run_sources(tx.as_mut(), job.tenant_id, job.run_id, self.pipeline.classifier()).await?;
                tx.commit().await?;
                info!(
                    run_id = %job.run_id,
                    classified = summary.classified,
                    duplicates = summary.duplicates_flagged,
                    "url sources classified"
                );
            }
        }
        Ok(Handled::Done)
    }
}
