//! Job-driven research ingestion: bundle acceptance, source acquisition,
//! classification, proposal ingestion and canonical resolution.

use std::sync::Arc;

use rip_core::{BackoffPolicy, EventStatus, ResearchEvent};
use rip_extract::ClassifierConfig;
use rip_fetch::{ArtifactStore, FetchPolicyEngine};
use rip_store::{JobQueue, ResearchStore, StoreResult, StoreTx};
use serde_json::Value;
use uuid::Uuid;

pub mod acquire;
pub mod classify;
pub mod config;
pub mod error;
pub mod ingest;
pub mod resolver;
pub mod worker;

pub use acquire::{AcquisitionSummary, AddSourcesResult};
pub use classify::ClassificationSummary;
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use ingest::{AcceptResult, ApproveResult, IngestionResult, SourceIndex};
pub use resolver::ResolveSummary;
pub use worker::{JobDisposition, JobReport, Worker};

pub const CRATE_NAME: &str = "rip-pipeline";

pub const JOB_INGEST_RUN: &str = "ingest_run";
pub const JOB_RESOLVE_CANONICAL: &str = "resolve_canonical";

/// Per-source fetch retry budget.
#[derive(Debug, Clone, Copy)]
pub struct FetchRetryPolicy {
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
}

pub struct Pipeline {
    store: Arc<dyn ResearchStore>,
    queue: JobQueue,
    fetcher: Arc<FetchPolicyEngine>,
    artifacts: ArtifactStore,
    classifier: ClassifierConfig,
    fetch_retry: FetchRetryPolicy,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ResearchStore>, config: &PipelineConfig) -> PipelineResult<Self> {
        let fetcher = FetchPolicyEngine::new(config.fetch.clone())?;
        Ok(Self::with_fetcher(store, config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(
        store: Arc<dyn ResearchStore>,
        config: &PipelineConfig,
        fetcher: Arc<FetchPolicyEngine>,
    ) -> Self {
        Self {
            queue: JobQueue::new(store.clone(), config.queue),
            store,
            fetcher,
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            classifier: config.classifier.clone(),
            fetch_retry: FetchRetryPolicy {
                max_attempts: config.max_fetch_attempts,
                backoff: config.fetch_backoff,
            },
        }
    }

    pub fn store(&self) -> &Arc<dyn ResearchStore> {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn classifier(&self) -> &ClassifierConfig {
        &self.classifier
    }

    /// Enqueues a resolver pass over the run's prospects.
    pub async fn request_resolve(&self, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<Uuid> {
        let mut tx = self.store.begin().await?;
        if tx.get_run(tenant_id, run_id).await?.is_none() {
            return Err(PipelineError::RunNotFound(run_id));
        }
        let job_id = self
            .queue
            .enqueue_in(tx.as_mut(), tenant_id, run_id, JOB_RESOLVE_CANONICAL, Value::Object(Default::default()))
            .await?;
        tx.commit().await?;
        Ok(job_id)
    }
}

pub(crate) async fn record_event(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    event_type: &str,
    status: EventStatus,
    input: Value,
    output: Value,
) -> StoreResult<()> {
    tx.append_event(&ResearchEvent::new(tenant_id, run_id, event_type, status, input, output))
        .await
}
