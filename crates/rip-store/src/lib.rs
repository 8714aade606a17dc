//! Persistence for runs, jobs, sources, proposals and canonical companies.
//!
//! Every operation runs inside a [`StoreTx`]. Dropping a transaction without
//! calling [`StoreTx::commit`] discards its writes. Inserts that back an
//! idempotent operation return `false` when a uniqueness key already exists.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rip_core::{
    CanonicalCompany, CanonicalCompanyDomain, CanonicalCompanyLink, CompanyAlias, CompanyMetric,
    CompanyProspect, CompanyProspectEvidence, ResearchEvent, ResearchJob, ResearchRun,
    ResearchRunBundle, ResearchRunStep, SourceDocument,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod queue;

pub use memory::{MemoryStore, RowCounts};
pub use postgres::PgStore;
pub use queue::{JobQueue, QueueConfig};

pub const CRATE_NAME: &str = "rip-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ResearchStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    // runs
    async fn insert_run(&mut self, run: &ResearchRun) -> StoreResult<()>;
    /// Row-locks the run for the rest of the transaction.
    async fn get_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Option<ResearchRun>>;
    async fn update_run(&mut self, run: &ResearchRun) -> StoreResult<()>;

    // bundles and steps
    async fn insert_bundle(&mut self, bundle: &ResearchRunBundle) -> StoreResult<bool>;
    async fn find_bundle(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        bundle_sha256: &str,
    ) -> StoreResult<Option<ResearchRunBundle>>;
    async fn upsert_run_step(&mut self, step: &ResearchRunStep) -> StoreResult<()>;
    async fn list_run_steps(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchRunStep>>;

    // jobs
    async fn insert_job(&mut self, job: &ResearchJob) -> StoreResult<()>;
    /// Atomically hands the oldest eligible job to `worker_id`.
    async fn claim_next_job(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<ResearchJob>>;
    /// Row-locks the job for the rest of the transaction.
    async fn get_job(&mut self, job_id: Uuid) -> StoreResult<Option<ResearchJob>>;
    async fn update_job(&mut self, job: &ResearchJob) -> StoreResult<()>;
    async fn list_jobs_for_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchJob>>;

    // sources
    /// Bundle sources are unique per `(tenant, run, content_hash)`, URL
    /// sources per `(tenant, run, url_normalized)`.
    async fn insert_source(&mut self, source: &SourceDocument) -> StoreResult<bool>;
    async fn find_source_by_hash(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        content_hash: &str,
    ) -> StoreResult<Option<SourceDocument>>;
    async fn find_source_by_url(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        url_normalized: &str,
    ) -> StoreResult<Option<SourceDocument>>;
    async fn get_source(&mut self, source_id: Uuid) -> StoreResult<Option<SourceDocument>>;
    /// Ordered by `(created_at, id)`.
    async fn list_sources(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<SourceDocument>>;
    async fn update_source(&mut self, source: &SourceDocument) -> StoreResult<()>;

    // events
    async fn append_event(&mut self, event: &ResearchEvent) -> StoreResult<()>;
    async fn list_events(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchEvent>>;

    // proposals
    async fn find_prospect(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        name_normalized: &str,
    ) -> StoreResult<Option<CompanyProspect>>;
    async fn insert_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()>;
    async fn update_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()>;
    /// Ordered by `(created_at, id)`.
    async fn list_prospects(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<CompanyProspect>>;
    /// Every run of the tenant, ordered by `(created_at, id)`.
    async fn list_tenant_prospects(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CompanyProspect>>;
    async fn insert_metric(&mut self, metric: &CompanyMetric) -> StoreResult<bool>;
    async fn list_metrics(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyMetric>>;
    async fn insert_alias(&mut self, alias: &CompanyAlias) -> StoreResult<bool>;
    async fn list_aliases(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyAlias>>;
    /// Unique per `(tenant, prospect, source_document, raw_snippet)`.
    async fn insert_evidence(&mut self, evidence: &CompanyProspectEvidence) -> StoreResult<bool>;
    async fn list_evidence(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyProspectEvidence>>;

    // canonical companies
    async fn find_canonical_by_domain(
        &mut self,
        tenant_id: Uuid,
        domain: &str,
    ) -> StoreResult<Option<CanonicalCompany>>;
    /// Only canonicals without a primary domain match on name and country.
    async fn find_canonical_by_name_country(
        &mut self,
        tenant_id: Uuid,
        name_normalized: &str,
        country_code: &str,
    ) -> StoreResult<Option<CanonicalCompany>>;
    async fn insert_canonical(&mut self, company: &CanonicalCompany) -> StoreResult<()>;
    async fn get_canonical(&mut self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<CanonicalCompany>>;
    async fn list_canonicals(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalCompany>>;
    async fn insert_canonical_domain(&mut self, domain: &CanonicalCompanyDomain) -> StoreResult<bool>;
    async fn list_canonical_domains(&mut self, canonical_company_id: Uuid) -> StoreResult<Vec<CanonicalCompanyDomain>>;
    async fn find_link(
        &mut self,
        canonical_company_id: Uuid,
        company_entity_id: Uuid,
    ) -> StoreResult<Option<CanonicalCompanyLink>>;
    /// Keyed by `(canonical_company_id, company_entity_id)`; returns true when created.
    async fn upsert_link(&mut self, link: &CanonicalCompanyLink) -> StoreResult<bool>;
    async fn list_links(
        &mut self,
        tenant_id: Uuid,
        canonical_company_id: Option<Uuid>,
    ) -> StoreResult<Vec<CanonicalCompanyLink>>;
}
