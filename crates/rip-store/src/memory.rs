//! In-memory [`ResearchStore`] used by tests and local runs.
//!
//! A transaction holds the store lock and mutates a private copy of the
//! tables; commit swaps the copy in. Transactions are therefore serialized.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rip_core::{
    CanonicalCompany, CanonicalCompanyDomain, CanonicalCompanyLink, CompanyAlias, CompanyMetric,
    CompanyProspect, CompanyProspectEvidence, JobStatus, ResearchEvent, ResearchJob, ResearchRun,
    ResearchRunBundle, ResearchRunStep, SourceDocument, SourceOrigin,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{ResearchStore, StoreResult, StoreTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    runs: Vec<ResearchRun>,
    bundles: Vec<ResearchRunBundle>,
    steps: Vec<ResearchRunStep>,
    jobs: Vec<ResearchJob>,
    sources: Vec<SourceDocument>,
    events: Vec<ResearchEvent>,
    prospects: Vec<CompanyProspect>,
    metrics: Vec<CompanyMetric>,
    aliases: Vec<CompanyAlias>,
    evidence: Vec<CompanyProspectEvidence>,
    canonicals: Vec<CanonicalCompany>,
    canonical_domains: Vec<CanonicalCompanyDomain>,
    links: Vec<CanonicalCompanyLink>,
}

/// Table sizes, for asserting that an operation wrote nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub runs: usize,
    pub bundles: usize,
    pub steps: usize,
    pub jobs: usize,
    pub sources: usize,
    pub events: usize,
    pub prospects: usize,
    pub metrics: usize,
    pub aliases: usize,
    pub evidence: usize,
    pub canonicals: usize,
    pub canonical_domains: usize,
    pub links: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_counts(&self) -> RowCounts {
        let state = self.state.lock().await;
        RowCounts {
            runs: state.runs.len(),
            bundles: state.bundles.len(),
            steps: state.steps.len(),
            jobs: state.jobs.len(),
            sources: state.sources.len(),
            events: state.events.len(),
            prospects: state.prospects.len(),
            metrics: state.metrics.len(),
            aliases: state.aliases.len(),
            evidence: state.evidence.len(),
            canonicals: state.canonicals.len(),
            canonical_domains: state.canonical_domains.len(),
            links: state.links.len(),
        }
    }
}

#[async_trait]
impl ResearchStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn sorted_by_creation<T: Clone>(
    rows: impl Iterator<Item = T>,
    key: impl Fn(&T) -> (DateTime<Utc>, Uuid),
) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|row| key(row));
    rows
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn insert_run(&mut self, run: &ResearchRun) -> StoreResult<()> {
        self.working.runs.retain(|r| r.id != run.id);
        self.working.runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Option<ResearchRun>> {
        Ok(self
            .working
            .runs
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.id == run_id)
            .cloned())
    }

    async fn update_run(&mut self, run: &ResearchRun) -> StoreResult<()> {
        if let Some(existing) = self.working.runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        }
        Ok(())
    }

    async fn insert_bundle(&mut self, bundle: &ResearchRunBundle) -> StoreResult<bool> {
        let exists = self.working.bundles.iter().any(|b| {
            b.tenant_id == bundle.tenant_id
                && b.run_id == bundle.run_id
                && b.bundle_sha256 == bundle.bundle_sha256
        });
        if !exists {
            self.working.bundles.push(bundle.clone());
        }
        Ok(!exists)
    }

    async fn find_bundle(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        bundle_sha256: &str,
    ) -> StoreResult<Option<ResearchRunBundle>> {
        Ok(self
            .working
            .bundles
            .iter()
            .find(|b| b.tenant_id == tenant_id && b.run_id == run_id && b.bundle_sha256 == bundle_sha256)
            .cloned())
    }

    async fn upsert_run_step(&mut self, step: &ResearchRunStep) -> StoreResult<()> {
        match self.working.steps.iter_mut().find(|s| {
            s.tenant_id == step.tenant_id && s.run_id == step.run_id && s.step.step_key == step.step.step_key
        }) {
            Some(existing) => {
                existing.step = step.step.clone();
                existing.updated_at = step.updated_at;
            }
            None => self.working.steps.push(step.clone()),
        }
        Ok(())
    }

    async fn list_run_steps(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchRunStep>> {
        let mut steps: Vec<ResearchRunStep> = self
            .working
            .steps
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step.step_key.cmp(&b.step.step_key));
        Ok(steps)
    }

    async fn insert_job(&mut self, job: &ResearchJob) -> StoreResult<()> {
        self.working.jobs.push(job.clone());
        Ok(())
    }

    async fn claim_next_job(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<ResearchJob>> {
        let next = self
            .working
            .jobs
            .iter_mut()
            .filter(|j| j.is_claimable(now, lease))
            .min_by_key(|j| (j.created_at, j.id));
        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn get_job(&mut self, job_id: Uuid) -> StoreResult<Option<ResearchJob>> {
        Ok(self.working.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn update_job(&mut self, job: &ResearchJob) -> StoreResult<()> {
        if let Some(existing) = self.working.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job.clone();
        }
        Ok(())
    }

    async fn list_jobs_for_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchJob>> {
        Ok(sorted_by_creation(
            self.working
                .jobs
                .iter()
                .filter(|j| j.tenant_id == tenant_id && j.run_id == run_id)
                .cloned(),
            |j| (j.created_at, j.id),
        ))
    }

    async fn insert_source(&mut self, source: &SourceDocument) -> StoreResult<bool> {
        let exists = self.working.sources.iter().any(|s| {
            s.tenant_id == source.tenant_id
                && s.run_id == source.run_id
                && s.origin == source.origin
                && match source.origin {
                    SourceOrigin::Bundle => s.content_hash.is_some() && s.content_hash == source.content_hash,
                    SourceOrigin::Url => s.url_normalized.is_some() && s.url_normalized == source.url_normalized,
                }
        });
        if !exists {
            self.working.sources.push(source.clone());
        }
        Ok(!exists)
    }

    async fn find_source_by_hash(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        content_hash: &str,
    ) -> StoreResult<Option<SourceDocument>> {
        Ok(sorted_by_creation(
            self.working.sources.iter().filter(|s| {
                s.tenant_id == tenant_id && s.run_id == run_id && s.content_hash.as_deref() == Some(content_hash)
            }),
            |s| (s.created_at, s.id),
        )
        .into_iter()
        .next()
        .cloned())
    }

    async fn find_source_by_url(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        url_normalized: &str,
    ) -> StoreResult<Option<SourceDocument>> {
        Ok(self
            .working
            .sources
            .iter()
            .find(|s| {
                s.tenant_id == tenant_id
                    && s.run_id == run_id
                    && s.origin == SourceOrigin::Url
                    && s.url_normalized.as_deref() == Some(url_normalized)
            })
            .cloned())
    }

    async fn get_source(&mut self, source_id: Uuid) -> StoreResult<Option<SourceDocument>> {
        Ok(self.working.sources.iter().find(|s| s.id == source_id).cloned())
    }

    async fn list_sources(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<SourceDocument>> {
        Ok(sorted_by_creation(
            self.working
                .sources
                .iter()
                .filter(|s| s.tenant_id == tenant_id && s.run_id == run_id)
                .cloned(),
            |s| (s.created_at, s.id),
        ))
    }

    async fn update_source(&mut self, source: &SourceDocument) -> StoreResult<()> {
        if let Some(existing) = self.working.sources.iter_mut().find(|s| s.id == source.id) {
            *existing = source.clone();
        }
        Ok(())
    }

    async fn append_event(&mut self, event: &ResearchEvent) -> StoreResult<()> {
        self.working.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchEvent>> {
        Ok(self
            .working
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_prospect(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        name_normalized: &str,
    ) -> StoreResult<Option<CompanyProspect>> {
        Ok(self
            .working
            .prospects
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.run_id == run_id && p.name_normalized == name_normalized)
            .cloned())
    }

    async fn insert_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()> {
        self.working.prospects.push(prospect.clone());
        Ok(())
    }

    async fn update_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()> {
        if let Some(existing) = self.working.prospects.iter_mut().find(|p| p.id == prospect.id) {
            *existing = prospect.clone();
        }
        Ok(())
    }

    async fn list_prospects(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<CompanyProspect>> {
        Ok(sorted_by_creation(
            self.working
                .prospects
                .iter()
                .filter(|p| p.tenant_id == tenant_id && p.run_id == run_id)
                .cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    async fn list_tenant_prospects(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CompanyProspect>> {
        Ok(sorted_by_creation(
            self.working.prospects.iter().filter(|p| p.tenant_id == tenant_id).cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    async fn insert_metric(&mut self, metric: &CompanyMetric) -> StoreResult<bool> {
        let exists = self
            .working
            .metrics
            .iter()
            .any(|m| m.prospect_id == metric.prospect_id && m.dedup_key == metric.dedup_key);
        if !exists {
            self.working.metrics.push(metric.clone());
        }
        Ok(!exists)
    }

    async fn list_metrics(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyMetric>> {
        Ok(self.working.metrics.iter().filter(|m| m.prospect_id == prospect_id).cloned().collect())
    }

    async fn insert_alias(&mut self, alias: &CompanyAlias) -> StoreResult<bool> {
        let exists = self
            .working
            .aliases
            .iter()
            .any(|a| a.prospect_id == alias.prospect_id && a.alias_name == alias.alias_name);
        if !exists {
            self.working.aliases.push(alias.clone());
        }
        Ok(!exists)
    }

    async fn list_aliases(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyAlias>> {
        Ok(self.working.aliases.iter().filter(|a| a.prospect_id == prospect_id).cloned().collect())
    }

    async fn insert_evidence(&mut self, evidence: &CompanyProspectEvidence) -> StoreResult<bool> {
        let exists = self.working.evidence.iter().any(|e| {
            e.tenant_id == evidence.tenant_id
                && e.prospect_id == evidence.prospect_id
                && e.source_document_id == evidence.source_document_id
                && e.raw_snippet == evidence.raw_snippet
        });
        if !exists {
            self.working.evidence.push(evidence.clone());
        }
        Ok(!exists)
    }

    async fn list_evidence(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyProspectEvidence>> {
        Ok(self.working.evidence.iter().filter(|e| e.prospect_id == prospect_id).cloned().collect())
    }

    async fn find_canonical_by_domain(
        &mut self,
        tenant_id: Uuid,
        domain: &str,
    ) -> StoreResult<Option<CanonicalCompany>> {
        let Some(row) = self
            .working
            .canonical_domains
            .iter()
            .find(|d| d.tenant_id == tenant_id && d.domain == domain)
        else {
            return Ok(None);
        };
        let canonical_id = row.canonical_company_id;
        Ok(self.working.canonicals.iter().find(|c| c.id == canonical_id).cloned())
    }

    async fn find_canonical_by_name_country(
        &mut self,
        tenant_id: Uuid,
        name_normalized: &str,
        country_code: &str,
    ) -> StoreResult<Option<CanonicalCompany>> {
        Ok(sorted_by_creation(
            self.working.canonicals.iter().filter(|c| {
                c.tenant_id == tenant_id
                    && c.primary_domain.is_none()
                    && c.name_normalized == name_normalized
                    && c.country_code.as_deref() == Some(country_code)
            }),
            |c| (c.created_at, c.id),
        )
        .into_iter()
        .next()
        .cloned())
    }

    async fn insert_canonical(&mut self, company: &CanonicalCompany) -> StoreResult<()> {
        self.working.canonicals.push(company.clone());
        Ok(())
    }

    async fn get_canonical(&mut self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<CanonicalCompany>> {
        Ok(self
            .working
            .canonicals
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.id == id)
            .cloned())
    }

    async fn list_canonicals(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalCompany>> {
        Ok(sorted_by_creation(
            self.working.canonicals.iter().filter(|c| c.tenant_id == tenant_id).cloned(),
            |c| (c.created_at, c.id),
        ))
    }

    async fn insert_canonical_domain(&mut self, domain: &CanonicalCompanyDomain) -> StoreResult<bool> {
        let exists = self
            .working
            .canonical_domains
            .iter()
            .any(|d| d.tenant_id == domain.tenant_id && d.domain == domain.domain);
        if !exists {
            self.working.canonical_domains.push(domain.clone());
        }
        Ok(!exists)
    }

    async fn list_canonical_domains(&mut self, canonical_company_id: Uuid) -> StoreResult<Vec<CanonicalCompanyDomain>> {
        Ok(self
            .working
            .canonical_domains
            .iter()
            .filter(|d| d.canonical_company_id == canonical_company_id)
            .cloned()
            .collect())
    }

    async fn find_link(
        &mut self,
        canonical_company_id: Uuid,
        company_entity_id: Uuid,
    ) -> StoreResult<Option<CanonicalCompanyLink>> {
        Ok(self
            .working
            .links
            .iter()
            .find(|l| l.canonical_company_id == canonical_company_id && l.company_entity_id == company_entity_id)
            .cloned())
    }

    async fn upsert_link(&mut self, link: &CanonicalCompanyLink) -> StoreResult<bool> {
        match self.working.links.iter_mut().find(|l| {
            l.canonical_company_id == link.canonical_company_id && l.company_entity_id == link.company_entity_id
        }) {
            Some(existing) => {
                existing.match_rule = link.match_rule;
                existing.evidence_source_document_id = link.evidence_source_document_id;
                existing.evidence_run_id = link.evidence_run_id;
                existing.updated_at = link.updated_at;
                Ok(false)
            }
            None => {
                self.working.links.push(link.clone());
                Ok(true)
            }
        }
    }

    async fn list_links(
        &mut self,
        tenant_id: Uuid,
        canonical_company_id: Option<Uuid>,
    ) -> StoreResult<Vec<CanonicalCompanyLink>> {
        Ok(sorted_by_creation(
            self.working.links.iter().filter(|l| {
                l.tenant_id == tenant_id && canonical_company_id.map_or(true, |id| l.canonical_company_id == id)
            }),
            |l| (l.created_at, l.id),
        )
        .into_iter()
        .cloned()
        .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        let run = ResearchRun::new(Uuid::new_v4(), "find robotics vendors", Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.insert_run(&run).await.unwrap();
        drop(tx);
        assert_eq!(store.row_counts().await.runs, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_run(&run).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.row_counts().await.runs, 1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_run(run.tenant_id, run.id).await.unwrap(), Some(run.clone()));
        assert_eq!(tx.get_run(Uuid::new_v4(), run.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unique_keys_reject_second_insert() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();

        let bundle = ResearchRunBundle {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            run_id,
            bundle_sha256: "abc".into(),
            bundle_json: json!({}),
            created_at: now,
        };
        assert!(tx.insert_bundle(&bundle).await.unwrap());
        assert!(!tx.insert_bundle(&ResearchRunBundle { id: Uuid::new_v4(), ..bundle }).await.unwrap());

        let source = SourceDocument::pending_url(tenant, run_id, "https://a.test/x", "https://a.test/x", now);
        assert!(tx.insert_source(&source).await.unwrap());
        let again = SourceDocument::pending_url(tenant, run_id, "https://a.test/x/", "https://a.test/x", now);
        assert!(!tx.insert_source(&again).await.unwrap());

        let evidence = CompanyProspectEvidence {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            prospect_id: Uuid::new_v4(),
            source_document_id: None,
            source_content_hash: None,
            source_type: "metric".into(),
            source_url: None,
            raw_snippet: "revenue grew".into(),
            evidence_weight: 0.5,
            created_at: now,
        };
        assert!(tx.insert_evidence(&evidence).await.unwrap());
        assert!(!tx
            .insert_evidence(&CompanyProspectEvidence { id: Uuid::new_v4(), ..evidence })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn name_country_lookup_skips_domain_keyed_canonicals() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        let canonical = |domain: Option<&str>| CanonicalCompany {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            canonical_name: "Acme".into(),
            name_normalized: "acme".into(),
            primary_domain: domain.map(str::to_string),
            country_code: Some("OM".into()),
            created_at: now,
            updated_at: now,
        };
        let mut tx = store.begin().await.unwrap();

        tx.insert_canonical(&canonical(Some("acme.example"))).await.unwrap();
        assert_eq!(tx.find_canonical_by_name_country(tenant, "acme", "OM").await.unwrap(), None);

        let by_name = canonical(None);
        tx.insert_canonical(&by_name).await.unwrap();
        assert_eq!(
            tx.find_canonical_by_name_country(tenant, "acme", "OM").await.unwrap(),
            Some(by_name)
        );
    }
}

