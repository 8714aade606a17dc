//! Bundle acceptance, review approval and proposal ingestion.
//!
//! `accept` and `approve` run synchronously for callers. The `ingest_run` job
//! replays the stored bundle inside a single store transaction, so a failed
//! ingestion leaves no partial rows behind.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rip_core::bundle::{parse_bundle, validate_bundle, validate_proposal, BundleSource, Proposal, ProposalCompany};
use rip_core::normalize::{canonicalize_url, normalize_company_name, normalize_metric_key};
use rip_core::{
    canonical_hash, CompanyAlias, CompanyMetric, CompanyProspect, CompanyProspectEvidence, EventStatus,
    ResearchEvent, ResearchJob, ResearchRun, ResearchRunBundle, ResearchRunStep, RunBundle, RunStatus, SourceDocument,
    SourceMeta, SourceOrigin, SourceStatus, ValidationReport, Validators,
};
use rip_store::StoreTx;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::classify_run_sources;
use crate::{record_event, Pipeline, PipelineError, PipelineResult, JOB_INGEST_RUN, JOB_RESOLVE_CANONICAL};

const COMPANY_EVIDENCE_TYPE: &str = "ai_proposal_company";
const COMPANY_EVIDENCE_WEIGHT: f64 = 0.8;
const METRIC_EVIDENCE_TYPE: &str = "ai_proposal_metric";
const METRIC_EVIDENCE_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptResult {
    pub run_id: Uuid,
    pub bundle_sha256: String,
    pub status: RunStatus,
    pub already_accepted: bool,
    pub message: String,
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproveResult {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionResult {
    pub companies_new: usize,
    pub companies_existing: usize,
    pub metrics_ingested: usize,
    pub aliases_ingested: usize,
    pub evidence_created: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl IngestionResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
struct IndexedSource {
    id: Uuid,
    url: Option<String>,
}

/// Source documents of a run, addressable by content hash and temp id.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    by_hash: HashMap<String, IndexedSource>,
    by_temp_id: HashMap<String, Uuid>,
}

impl SourceIndex {
    pub fn insert(&mut self, source: &SourceDocument) {
        if let Some(hash) = &source.content_hash {
            if source.origin == SourceOrigin::Bundle {
                self.by_hash.insert(
                    hash.to_ascii_lowercase(),
                    IndexedSource {
                        id: source.id,
                        url: source.url.clone(),
                    },
                );
            }
        }
        if let Some(temp_id) = &source.meta.temp_id {
            self.by_temp_id.insert(temp_id.clone(), source.id);
        }
    }

    pub fn link_temp_id(&mut self, temp_id: impl Into<String>, source_id: Uuid) {
        self.by_temp_id.entry(temp_id.into()).or_insert(source_id);
    }

    pub fn source_for_hash(&self, sha256: &str) -> Option<Uuid> {
        self.by_hash.get(&sha256.trim().to_ascii_lowercase()).map(|s| s.id)
    }

    pub fn source_for_temp_id(&self, temp_id: &str) -> Option<Uuid> {
        self.by_temp_id.get(temp_id).copied()
    }

    fn get(&self, sha256: &str) -> Option<&IndexedSource> {
        self.by_hash.get(sha256)
    }
}

/// Parses and validates an uploaded body without touching storage.
pub fn validate(raw: &Value, expected_run_id: Option<Uuid>) -> ValidationReport {
    match parse_bundle(raw) {
        Ok(bundle) => validate_bundle(&bundle, expected_run_id),
        Err(report) => report,
    }
}

fn report_summary(report: &ValidationReport) -> String {
    report
        .errors
        .iter()
        .map(|e| format!("{}: {}", e.loc, e.msg))
        .collect::<Vec<_>>()
        .join("; ")
}

fn ingest_payload(bundle_sha256: &str) -> Value {
    json!({ "bundle_sha256": bundle_sha256 })
}

impl Pipeline {
    pub async fn create_run(&self, tenant_id: Uuid, objective: &str) -> PipelineResult<ResearchRun> {
        let objective = objective.trim();
        if objective.is_empty() {
            return Err(PipelineError::InvalidInput("objective must not be empty".to_string()));
        }
        let run = ResearchRun::new(tenant_id, objective, Utc::now());
        let mut tx = self.store.begin().await?;
        tx.insert_run(&run).await?;
        record_event(
            tx.as_mut(),
            tenant_id,
            run.id,
            "run_created",
            EventStatus::Ok,
            json!({ "objective": objective }),
            json!({}),
        )
        .await?;
        tx.commit().await?;
        info!(run_id = %run.id, %tenant_id, "research run created");
        Ok(run)
    }

    pub async fn accept(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
        raw: &Value,
        accept_only: bool,
    ) -> PipelineResult<AcceptResult> {
        let mut tx = self.store.begin().await?;
        let mut run = tx
            .get_run(tenant_id, run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        let bundle = parse_bundle(raw).map_err(PipelineError::Validation)?;
        let report = validate_bundle(&bundle, Some(run_id));
        if !report.ok() {
            warn!(%run_id, errors = report.errors.len(), "bundle rejected");
            return Err(PipelineError::Validation(report));
        }
        let bundle_sha256 = bundle.content_hash()?;

        if run.bundle_sha256.as_deref() == Some(bundle_sha256.as_str()) {
            info!(%run_id, %bundle_sha256, "bundle already accepted");
            return Ok(AcceptResult {
                run_id,
                bundle_sha256,
                status: run.status,
                already_accepted: true,
                message: "Bundle already accepted".to_string(),
                job_id: None,
            });
        }

        let now = Utc::now();
        tx.insert_bundle(&ResearchRunBundle {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            bundle_sha256: bundle_sha256.clone(),
            bundle_json: raw.clone(),
            created_at: now,
        })
        .await?;

        run.bundle_sha256 = Some(bundle_sha256.clone());
        run.plan_json = bundle.plan_json.clone();
        run.last_error = None;
        run.updated_at = now;

        let (job_id, message) = if accept_only {
            run.status = RunStatus::NeedsReview;
            (None, "Bundle accepted for review".to_string())
        } else {
            run.status = RunStatus::Ingesting;
            let job_id = self
                .queue
                .enqueue_in(tx.as_mut(), tenant_id, run_id, JOB_INGEST_RUN, ingest_payload(&bundle_sha256))
                .await?;
            (
                Some(job_id),
                format!("Bundle accepted for background processing (job: {job_id})"),
            )
        };
        tx.update_run(&run).await?;

        record_event(
            tx.as_mut(),
            tenant_id,
            run_id,
            "bundle_accepted",
            EventStatus::Ok,
            json!({ "bundle_sha256": bundle_sha256, "accept_only": accept_only }),
            json!({
                "status": run.status.as_str(),
                "job_id": job_id,
                "sources": bundle.sources.len(),
                "steps": bundle.steps.len(),
                "warnings": report.warnings,
            }),
        )
        .await?;
        tx.commit().await?;

        info!(%run_id, %bundle_sha256, status = run.status.as_str(), "bundle accepted");
        Ok(AcceptResult {
            run_id,
            bundle_sha256,
            status: run.status,
            already_accepted: false,
            message,
            job_id,
        })
    }

    pub async fn approve(&self, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<ApproveResult> {
        let mut tx = self.store.begin().await?;
        let mut run = tx
            .get_run(tenant_id, run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        if run.status != RunStatus::NeedsReview {
            return Err(PipelineError::NotReviewable(format!(
                "run_status_not_reviewable: {}",
                run.status.as_str()
            )));
        }
        let bundle_sha256 = run
            .bundle_sha256
            .clone()
            .ok_or_else(|| PipelineError::NotReviewable("run_missing_bundle".to_string()))?;
        if tx.find_bundle(tenant_id, run_id, &bundle_sha256).await?.is_none() {
            return Err(PipelineError::NotReviewable("stored_bundle_not_found".to_string()));
        }

        let job_id = self
            .queue
            .enqueue_in(tx.as_mut(), tenant_id, run_id, JOB_INGEST_RUN, ingest_payload(&bundle_sha256))
            .await?;
        run.status = RunStatus::Ingesting;
        run.updated_at = Utc::now();
        tx.update_run(&run).await?;
        record_event(
            tx.as_mut(),
            tenant_id,
            run_id,
            "bundle_approved",
            EventStatus::Ok,
            json!({ "bundle_sha256": bundle_sha256 }),
            json!({ "job_id": job_id }),
        )
        .await?;
        tx.commit().await?;

        info!(%run_id, %job_id, "bundle approved for ingestion");
        Ok(ApproveResult {
            run_id,
            job_id,
            status: run.status,
            message: format!("Bundle approved for background ingestion (job: {job_id})"),
        })
    }

    /// Job-time ingestion of the bundle named in the job payload. Returns
    /// `None` when the job is stale or the bundle was already ingested.
    pub(crate) async fn ingest_stored_bundle(
        &self,
        job: &ResearchJob,
        bundle_sha256: &str,
    ) -> PipelineResult<Option<IngestionResult>> {
        let (tenant_id, run_id) = (job.tenant_id, job.run_id);
        let mut tx = self.store.begin().await?;
        let mut run = tx
            .get_run(tenant_id, run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        if run.bundle_sha256.as_deref() != Some(bundle_sha256) {
            info!(%run_id, bundle_sha256, "bundle superseded, skipping ingestion");
            return Ok(None);
        }
        match run.status {
            RunStatus::Ingesting | RunStatus::Failed => {}
            RunStatus::Submitted => {
                info!(%run_id, "bundle already ingested");
                return Ok(None);
            }
            other => {
                warn!(%run_id, status = other.as_str(), "run not awaiting ingestion");
                return Ok(None);
            }
        }

        let stored = tx
            .find_bundle(tenant_id, run_id, bundle_sha256)
            .await?
            .ok_or_else(|| PipelineError::Ingestion("stored_bundle_not_found".to_string()))?;
        let bundle = parse_bundle(&stored.bundle_json)
            .map_err(|report| PipelineError::Ingestion(format!("bundle_parse_error: {}", report_summary(&report))))?;
        let proposal = bundle
            .parse_proposal()
            .map_err(|err| PipelineError::Ingestion(format!("proposal_validation_error: {err}")))?;
        check_company_evidence(&bundle, &proposal)?;
        check_proposal_schema(&bundle, &proposal)?;

        let now = Utc::now();
        let mut index = SourceIndex::default();
        for source in &bundle.sources {
            let document = bundle_source_document(tenant_id, run_id, source);
            let row = if tx.insert_source(&document).await? {
                document
            } else {
                tx.find_source_by_hash(tenant_id, run_id, &source.sha256)
                    .await?
                    .unwrap_or(document)
            };
            index.insert(&row);
        }
        link_legacy_sources(tx.as_mut(), tenant_id, run_id, &proposal, &mut index).await?;

        for step in &bundle.steps {
            tx.upsert_run_step(&ResearchRunStep {
                id: Uuid::new_v4(),
                tenant_id,
                run_id,
                step: step.clone(),
                updated_at: now,
            })
            .await?;
        }

        let classification = classify_run_sources(tx.as_mut(), tenant_id, run_id, &self.classifier).await?;

        let result = ingest(tx.as_mut(), tenant_id, run_id, &proposal, &index).await?;
        if !result.success() {
            return Err(PipelineError::Ingestion(format!("ingestion_failed:{}", result.errors.join(";"))));
        }

        run.status = RunStatus::Submitted;
        run.last_error = None;
        run.updated_at = Utc::now();
        tx.update_run(&run).await?;
        record_event(
            tx.as_mut(),
            tenant_id,
            run_id,
            "bundle_ingested",
            EventStatus::Ok,
            json!({ "bundle_sha256": bundle_sha256, "job_id": job.id }),
            json!({ "ingestion": result, "classification": classification }),
        )
        .await?;
        let resolve_job = self
            .queue
            .enqueue_in(tx.as_mut(), tenant_id, run_id, JOB_RESOLVE_CANONICAL, json!({ "bundle_sha256": bundle_sha256 }))
            .await?;
        tx.commit().await?;

        info!(
            %run_id,
            companies_new = result.companies_new,
            companies_existing = result.companies_existing,
            metrics = result.metrics_ingested,
            evidence = result.evidence_created,
            %resolve_job,
            "bundle ingested"
        );
        Ok(Some(result))
    }

    /// Fails a bundle-backed run, unless the run has moved on to another bundle.
    pub(crate) async fn mark_run_failed(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
        bundle_sha256: &str,
        message: &str,
    ) -> PipelineResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(mut run) = tx.get_run(tenant_id, run_id).await? else {
            return Ok(());
        };
        if !matches!(run.status, RunStatus::Ingesting | RunStatus::Failed)
            || run.bundle_sha256.as_deref() != Some(bundle_sha256)
        {
            return Ok(());
        }
        run.status = RunStatus::Failed;
        run.last_error = Some(message.to_string());
        run.updated_at = Utc::now();
        tx.update_run(&run).await?;
        tx.append_event(
            &ResearchEvent::new(
                tenant_id,
                run_id,
                "bundle_ingest_failed",
                EventStatus::Failed,
                json!({ "bundle_sha256": bundle_sha256 }),
                json!({}),
            )
            .with_error(message),
        )
        .await?;
        tx.commit().await?;
        warn!(%run_id, error = message, "run marked failed");
        Ok(())
    }
}

fn check_company_evidence(bundle: &RunBundle, proposal: &Proposal) -> PipelineResult<()> {
    let known: HashSet<&str> = bundle.sources.iter().map(|s| s.sha256.as_str()).collect();
    for company in &proposal.companies {
        if company.evidence_snippets.is_empty() {
            return Err(PipelineError::Ingestion(format!(
                "company_missing_evidence_snippets:{}",
                company.name
            )));
        }
        if company.source_sha256s.is_empty() {
            return Err(PipelineError::Ingestion(format!(
                "company_missing_source_sha256s:{}",
                company.name
            )));
        }
        for sha in &company.source_sha256s {
            if !known.contains(sha.trim().to_ascii_lowercase().as_str()) {
                return Err(PipelineError::Ingestion(format!(
                    "company_references_unknown_source:{}:{}",
                    company.name, sha
                )));
            }
        }
    }
    Ok(())
}

fn check_proposal_schema(bundle: &RunBundle, proposal: &Proposal) -> PipelineResult<()> {
    let known: HashSet<&str> = bundle.sources.iter().map(|s| s.sha256.as_str()).collect();
    let temp_ids: HashSet<&str> = bundle.sources.iter().filter_map(|s| s.temp_id.as_deref()).collect();
    let report = validate_proposal(proposal, &known, &temp_ids);
    if report.ok() {
        Ok(())
    } else {
        Err(PipelineError::Ingestion(format!(
            "proposal_validation_error: {}",
            report_summary(&report)
        )))
    }
}

fn bundle_source_document(tenant_id: Uuid, run_id: Uuid, source: &BundleSource) -> SourceDocument {
    let now = Utc::now();
    SourceDocument {
        id: Uuid::new_v4(),
        tenant_id,
        run_id,
        origin: SourceOrigin::Bundle,
        url: source.url.clone(),
        url_normalized: source.url.as_deref().and_then(|u| canonicalize_url(u).ok()),
        title: source.title.clone(),
        mime_type: Some(source.mime_type.clone().unwrap_or_else(|| "text/plain".to_string())),
        status: SourceStatus::Fetched,
        failure_kind: None,
        attempt_count: 0,
        next_retry_at: None,
        http_status_code: None,
        content_hash: Some(source.sha256.clone()),
        content_text: Some(source.content_text.clone()),
        fetched_at: Some(source.retrieved_at.unwrap_or(now)),
        last_error: None,
        validators: Validators::default(),
        meta: SourceMeta {
            temp_id: source.temp_id.clone(),
            bundle_meta: Some(source.meta.clone()),
            ..SourceMeta::default()
        },
        created_at: now,
        updated_at: now,
    }
}

/// Legacy `proposal.sources` temp ids resolve to URL sources already attached
/// to the run. Unknown URLs stay unlinked.
async fn link_legacy_sources(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    proposal: &Proposal,
    index: &mut SourceIndex,
) -> PipelineResult<()> {
    for source in &proposal.sources {
        if index.source_for_temp_id(&source.temp_id).is_some() {
            continue;
        }
        let Ok(url_normalized) = canonicalize_url(&source.url) else {
            continue;
        };
        if let Some(document) = tx.find_source_by_url(tenant_id, run_id, &url_normalized).await? {
            index.link_temp_id(source.temp_id.clone(), document.id);
        }
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn fill_if_empty(slot: &mut Option<String>, value: Option<String>) -> bool {
    let empty = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    match value {
        Some(value) if empty => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}

fn country_code(company: &ProposalCompany) -> Option<String> {
    non_empty(company.hq_country.as_deref()).map(|c| c.to_ascii_uppercase())
}

/// Upserts the proposal's facts inside the caller's transaction.
pub async fn ingest(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    proposal: &Proposal,
    sources: &SourceIndex,
) -> PipelineResult<IngestionResult> {
    let mut result = IngestionResult::default();

    for company in &proposal.companies {
        let name_normalized = normalize_company_name(&company.name);
        if name_normalized.is_empty() {
            result.errors.push(format!("company_name_empty:{}", company.name));
            continue;
        }

        let prospect = upsert_prospect(tx, tenant_id, run_id, company, &name_normalized, &mut result).await?;
        ingest_metrics(tx, tenant_id, run_id, &prospect, company, sources, &mut result).await?;

        for alias in &company.aliases {
            let alias_name = alias.name.trim();
            if alias_name.is_empty() {
                continue;
            }
            let row = CompanyAlias {
                id: Uuid::new_v4(),
                tenant_id,
                prospect_id: prospect.id,
                alias_name: alias_name.to_string(),
                alias_type: alias.alias_type.trim().to_ascii_lowercase(),
                confidence: alias.confidence,
                created_at: Utc::now(),
            };
            if tx.insert_alias(&row).await? {
                result.aliases_ingested += 1;
            }
        }

        let hashes = &company.source_sha256s;
        if hashes.is_empty() {
            result.errors.push(format!("company_missing_source_sha256s:{}", company.name));
            continue;
        }
        for (i, snippet) in company.evidence_snippets.iter().enumerate() {
            let snippet = snippet.trim();
            if snippet.is_empty() {
                continue;
            }
            let sha = hashes[i % hashes.len()].trim().to_ascii_lowercase();
            let source = sources.get(&sha);
            if source.is_none() {
                result
                    .warnings
                    .push(format!("company_source_not_linked:{}:{}", company.name, sha));
            }
            let evidence = CompanyProspectEvidence {
                id: Uuid::new_v4(),
                tenant_id,
                prospect_id: prospect.id,
                source_document_id: source.map(|s| s.id),
                source_content_hash: Some(sha.clone()),
                source_type: COMPANY_EVIDENCE_TYPE.to_string(),
                source_url: source.and_then(|s| s.url.clone()),
                raw_snippet: snippet.to_string(),
                evidence_weight: COMPANY_EVIDENCE_WEIGHT,
                created_at: Utc::now(),
            };
            if tx.insert_evidence(&evidence).await? {
                result.evidence_created += 1;
            }
        }
    }

    Ok(result)
}

async fn upsert_prospect(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    company: &ProposalCompany,
    name_normalized: &str,
    result: &mut IngestionResult,
) -> PipelineResult<CompanyProspect> {
    let now = Utc::now();
    if let Some(mut prospect) = tx.find_prospect(tenant_id, run_id, name_normalized).await? {
        result.companies_existing += 1;
        if company.ai_rank.is_some() {
            prospect.ai_rank = company.ai_rank;
        }
        if company.ai_score.is_some() {
            prospect.ai_score = company.ai_score;
        }
        fill_if_empty(&mut prospect.website_url, non_empty(company.website_url.as_deref()));
        fill_if_empty(&mut prospect.hq_country, country_code(company));
        fill_if_empty(&mut prospect.hq_city, non_empty(company.hq_city.as_deref()));
        fill_if_empty(&mut prospect.sector, non_empty(company.sector.as_deref()));
        fill_if_empty(&mut prospect.description, non_empty(company.description.as_deref()));
        prospect.updated_at = now;
        tx.update_prospect(&prospect).await?;
        return Ok(prospect);
    }

    let prospect = CompanyProspect {
        id: Uuid::new_v4(),
        tenant_id,
        run_id,
        name_raw: company.name.trim().to_string(),
        name_normalized: name_normalized.to_string(),
        website_url: non_empty(company.website_url.as_deref()),
        hq_country: country_code(company),
        hq_city: non_empty(company.hq_city.as_deref()),
        sector: non_empty(company.sector.as_deref()),
        description: non_empty(company.description.as_deref()),
        ai_rank: company.ai_rank,
        ai_score: company.ai_score,
        created_at: now,
        updated_at: now,
    };
    tx.insert_prospect(&prospect).await?;
    result.companies_new += 1;
    Ok(prospect)
}

async fn ingest_metrics(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    prospect: &CompanyProspect,
    company: &ProposalCompany,
    sources: &SourceIndex,
    result: &mut IngestionResult,
) -> PipelineResult<()> {
    for metric in &company.metrics {
        let value = match metric.typed_value() {
            Ok(value) => value,
            Err(msg) => {
                result
                    .errors
                    .push(format!("metric_invalid:{}:{}:{}", company.name, metric.key, msg));
                continue;
            }
        };
        let metric_key = normalize_metric_key(&metric.key);
        if metric_key.is_empty() {
            result.errors.push(format!("metric_key_empty:{}:{}", company.name, metric.key));
            continue;
        }
        let source_document_id = metric
            .source_temp_id
            .as_deref()
            .and_then(|temp_id| sources.source_for_temp_id(temp_id));

        let dedup_key = canonical_hash(&json!({
            "prospect_id": prospect.id,
            "key": metric_key,
            "type": value.metric_type().as_str(),
            "as_of_date": metric.as_of_date,
            "source_document_id": source_document_id,
            "value": metric.value,
        }))?;

        let row = CompanyMetric {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            prospect_id: prospect.id,
            metric_key,
            value,
            currency: non_empty(metric.currency.as_deref()).map(|c| c.to_ascii_uppercase()),
            unit: non_empty(metric.unit.as_deref()),
            as_of_date: metric.as_of_date,
            confidence: metric.confidence,
            source_document_id,
            dedup_key,
            created_at: Utc::now(),
        };
        if tx.insert_metric(&row).await? {
            result.metrics_ingested += 1;
        }

        if let Some(snippet) = non_empty(metric.evidence_snippet.as_deref()) {
            let evidence = CompanyProspectEvidence {
                id: Uuid::new_v4(),
                tenant_id,
                prospect_id: prospect.id,
                source_document_id: None,
                source_content_hash: None,
                source_type: METRIC_EVIDENCE_TYPE.to_string(),
                source_url: None,
                raw_snippet: snippet,
                evidence_weight: metric.confidence.unwrap_or(METRIC_EVIDENCE_WEIGHT),
                created_at: Utc::now(),
            };
            if tx.insert_evidence(&evidence).await? {
                result.evidence_created += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rip_core::bundle::{ProposalAlias, ProposalMetric};
    use rip_core::MetricType;
    use rip_store::{MemoryStore, ResearchStore};

    fn company(name: &str) -> ProposalCompany {
        ProposalCompany {
            name: name.to_string(),
            aliases: vec![ProposalAlias {
                name: "Acme".to_string(),
                alias_type: "Trade".to_string(),
                confidence: Some(0.9),
            }],
            metrics: vec![ProposalMetric {
                key: "Employee Count".to_string(),
                metric_type: MetricType::Number,
                value: json!(120),
                currency: None,
                unit: None,
                as_of_date: None,
                confidence: Some(0.7),
                source_temp_id: Some("s1".to_string()),
                evidence_snippet: Some("about 120 staff".to_string()),
            }],
            website_url: None,
            hq_country: Some("OM".to_string()),
            hq_city: None,
            sector: Some("Logistics".to_string()),
            description: None,
            ai_rank: Some(2),
            ai_score: Some(0.4),
            evidence_snippets: vec!["first".to_string(), "second".to_string(), "third".to_string()],
            source_sha256s: vec!["a".repeat(64), "b".repeat(64)],
        }
    }

    fn proposal(companies: Vec<ProposalCompany>) -> Proposal {
        Proposal {
            query: "logistics in oman".to_string(),
            sources: Vec::new(),
            companies,
            generated_at: None,
            model: None,
        }
    }

    fn indexed_sources(tenant_id: Uuid, run_id: Uuid) -> (SourceIndex, Vec<SourceDocument>) {
        let mut index = SourceIndex::default();
        let docs: Vec<_> = ["a", "b"]
            .iter()
            .map(|c| {
                let mut doc = bundle_source_document(
                    tenant_id,
                    run_id,
                    &BundleSource {
                        sha256: c.repeat(64),
                        url: Some(format!("https://{c}.example/")),
                        retrieved_at: None,
                        mime_type: None,
                        title: None,
                        content_text: "text".to_string(),
                        meta: json!({}),
                        temp_id: None,
                    },
                );
                if *c == "a" {
                    doc.meta.temp_id = Some("s1".to_string());
                }
                index.insert(&doc);
                doc
            })
            .collect();
        (index, docs)
    }

    #[tokio::test]
    async fn second_ingest_of_same_proposal_adds_nothing() {
        let store = MemoryStore::new();
        let (tenant_id, run_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (sources, _) = indexed_sources(tenant_id, run_id);
        let proposal = proposal(vec![company("Acme Logistics LLC")]);

        let mut tx = store.begin().await.unwrap();
        let first = ingest(tx.as_mut(), tenant_id, run_id, &proposal, &sources).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(first.companies_new, 1);
        assert_eq!(first.metrics_ingested, 1);
        assert_eq!(first.aliases_ingested, 1);
        // three company snippets plus the metric snippet
        assert_eq!(first.evidence_created, 4);

        let mut tx = store.begin().await.unwrap();
        let second = ingest(tx.as_mut(), tenant_id, run_id, &proposal, &sources).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(second.companies_new, 0);
        assert_eq!(second.companies_existing, 1);
        assert_eq!(second.metrics_ingested, 0);
        assert_eq!(second.aliases_ingested, 0);
        assert_eq!(second.evidence_created, 0);
    }

    #[tokio::test]
    async fn snippets_cycle_through_source_hashes() {
        let store = MemoryStore::new();
        let (tenant_id, run_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (sources, docs) = indexed_sources(tenant_id, run_id);

        let mut tx = store.begin().await.unwrap();
        ingest(tx.as_mut(), tenant_id, run_id, &proposal(vec![company("Acme")]), &sources)
            .await
            .unwrap();
        let prospect = tx.find_prospect(tenant_id, run_id, "acme").await.unwrap().unwrap();
        let evidence = tx.list_evidence(prospect.id).await.unwrap();
        let mut linked: Vec<_> = evidence
            .iter()
            .filter(|e| e.source_type == COMPANY_EVIDENCE_TYPE)
            .map(|e| (e.raw_snippet.as_str(), e.source_document_id))
            .collect();
        linked.sort_by_key(|(snippet, _)| *snippet);
        assert_eq!(
            linked,
            vec![
                ("first", Some(docs[0].id)),
                ("second", Some(docs[1].id)),
                ("third", Some(docs[0].id)),
            ]
        );

        let metrics = tx.list_metrics(prospect.id).await.unwrap();
        assert_eq!(metrics[0].metric_key, "employee_count");
        assert_eq!(metrics[0].source_document_id, Some(docs[0].id));
        let aliases = tx.list_aliases(prospect.id).await.unwrap();
        assert_eq!(aliases[0].alias_type, "trade");
    }

    #[tokio::test]
    async fn existing_prospect_keeps_descriptive_fields_and_takes_new_rank() {
        let store = MemoryStore::new();
        let (tenant_id, run_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (sources, _) = indexed_sources(tenant_id, run_id);

        let mut tx = store.begin().await.unwrap();
        ingest(tx.as_mut(), tenant_id, run_id, &proposal(vec![company("Acme")]), &sources)
            .await
            .unwrap();

        let mut update = company("ACME Ltd");
        update.sector = Some("Shipping".to_string());
        update.description = Some("Freight forwarder".to_string());
        update.ai_rank = Some(1);
        update.ai_score = None;
        let result = ingest(tx.as_mut(), tenant_id, run_id, &proposal(vec![update]), &sources)
            .await
            .unwrap();
        assert_eq!(result.companies_existing, 1);

        let prospect = tx.find_prospect(tenant_id, run_id, "acme").await.unwrap().unwrap();
        assert_eq!(prospect.sector.as_deref(), Some("Logistics"));
        assert_eq!(prospect.description.as_deref(), Some("Freight forwarder"));
        assert_eq!(prospect.hq_country.as_deref(), Some("OM"));
        assert_eq!(prospect.ai_rank, Some(1));
        assert_eq!(prospect.ai_score, Some(0.4));
    }

    #[tokio::test]
    async fn mistyped_metric_is_an_ingestion_error() {
        let store = MemoryStore::new();
        let (tenant_id, run_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (sources, _) = indexed_sources(tenant_id, run_id);
        let mut bad = company("Acme");
        bad.metrics[0].value = json!("lots");

        let mut tx = store.begin().await.unwrap();
        let result = ingest(tx.as_mut(), tenant_id, run_id, &proposal(vec![bad]), &sources)
            .await
            .unwrap();
        assert!(!result.success());
        assert!(result.errors[0].starts_with("metric_invalid:Acme:Employee Count"));
    }

    #[test]
    fn validate_reports_shape_errors_against_body() {
        let report = validate(&json!({"run_id": "not-a-uuid"}), None);
        assert!(!report.ok());
        assert_eq!(report.errors[0].loc, "body");
    }
}
