//! Postgres [`ResearchStore`] built on runtime-checked `sqlx` queries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rip_core::bundle::{StepStatus, StepType};
use rip_core::{
    CanonicalCompany, CanonicalCompanyDomain, CanonicalCompanyLink, CompanyAlias, CompanyMetric,
    CompanyProspect, CompanyProspectEvidence, EventStatus, FailureKind, JobStatus, MatchRule,
    MetricValue, ResearchEvent, ResearchJob, ResearchRun, ResearchRunBundle, ResearchRunStep,
    RunStatus, RunStep, SourceDocument, SourceMeta, SourceOrigin, Validators,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{ResearchStore, StoreError, StoreResult, StoreTx};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ResearchStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.into(),
    }
}

fn parse_with<T>(table: &'static str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> StoreResult<T> {
    parse(raw).ok_or_else(|| corrupt(table, format!("unknown value {raw:?}")))
}

fn enum_text<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

fn enum_from_text<T: DeserializeOwned>(raw: String) -> StoreResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw))?)
}

const RUN_COLUMNS: &str =
    "id, tenant_id, objective, status, bundle_sha256, plan_json, last_error, created_at, updated_at";

fn run_from_row(row: &PgRow) -> StoreResult<ResearchRun> {
    let status: String = row.try_get("status")?;
    Ok(ResearchRun {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        objective: row.try_get("objective")?,
        status: parse_with("research_runs", &status, RunStatus::parse)?,
        bundle_sha256: row.try_get("bundle_sha256")?,
        plan_json: row.try_get("plan_json")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bundle_from_row(row: &PgRow) -> StoreResult<ResearchRunBundle> {
    Ok(ResearchRunBundle {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        bundle_sha256: row.try_get("bundle_sha256")?,
        bundle_json: row.try_get("bundle_json")?,
        created_at: row.try_get("created_at")?,
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<ResearchRunStep> {
    let step_type: StepType = enum_from_text(row.try_get("step_type")?)?;
    let status: StepStatus = enum_from_text(row.try_get("status")?)?;
    Ok(ResearchRunStep {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        step: RunStep {
            step_key: row.try_get("step_key")?,
            step_type,
            status,
            inputs_json: row.try_get("inputs_json")?,
            outputs_json: row.try_get("outputs_json")?,
            provider_meta: row.try_get("provider_meta")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            output_sha256: row.try_get("output_sha256")?,
            error: row.try_get("error")?,
        },
        updated_at: row.try_get("updated_at")?,
    })
}

const JOB_COLUMNS: &str = "id, tenant_id, run_id, job_type, status, attempts, max_attempts, retry_at, \
     locked_by, locked_at, payload, last_error, created_at, updated_at";

fn job_from_row(row: &PgRow) -> StoreResult<ResearchJob> {
    let status: String = row.try_get("status")?;
    Ok(ResearchJob {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        job_type: row.try_get("job_type")?,
        status: parse_with("research_jobs", &status, JobStatus::parse)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        retry_at: row.try_get("retry_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        payload: row.try_get("payload")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SOURCE_COLUMNS: &str = "id, tenant_id, run_id, origin, url, url_normalized, title, mime_type, status, \
     failure_kind, attempt_count, next_retry_at, http_status_code, content_hash, content_text, fetched_at, \
     last_error, validators, meta, created_at, updated_at";

fn source_from_row(row: &PgRow) -> StoreResult<SourceDocument> {
    let origin: String = row.try_get("origin")?;
    let status: String = row.try_get("status")?;
    let failure_kind = row
        .try_get::<Option<String>, _>("failure_kind")?
        .map(|raw| parse_with("source_documents", &raw, FailureKind::parse))
        .transpose()?;
    let validators: Json<Validators> = row.try_get("validators")?;
    let meta: Json<SourceMeta> = row.try_get("meta")?;
    Ok(SourceDocument {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        origin: parse_with("source_documents", &origin, SourceOrigin::parse)?,
        url: row.try_get("url")?,
        url_normalized: row.try_get("url_normalized")?,
        title: row.try_get("title")?,
        mime_type: row.try_get("mime_type")?,
        status: parse_with("source_documents", &status, rip_core::SourceStatus::parse)?,
        failure_kind,
        attempt_count: row.try_get("attempt_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        http_status_code: row.try_get("http_status_code")?,
        content_hash: row.try_get("content_hash")?,
        content_text: row.try_get("content_text")?,
        fetched_at: row.try_get("fetched_at")?,
        last_error: row.try_get("last_error")?,
        validators: validators.0,
        meta: meta.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<ResearchEvent> {
    let status: String = row.try_get("status")?;
    Ok(ResearchEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        event_type: row.try_get("event_type")?,
        status: parse_with("research_events", &status, EventStatus::parse)?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

const PROSPECT_COLUMNS: &str = "id, tenant_id, run_id, name_raw, name_normalized, website_url, hq_country, \
     hq_city, sector, description, ai_rank, ai_score, created_at, updated_at";

fn prospect_from_row(row: &PgRow) -> StoreResult<CompanyProspect> {
    Ok(CompanyProspect {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        name_raw: row.try_get("name_raw")?,
        name_normalized: row.try_get("name_normalized")?,
        website_url: row.try_get("website_url")?,
        hq_country: row.try_get("hq_country")?,
        hq_city: row.try_get("hq_city")?,
        sector: row.try_get("sector")?,
        description: row.try_get("description")?,
        ai_rank: row.try_get("ai_rank")?,
        ai_score: row.try_get("ai_score")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn metric_from_row(row: &PgRow) -> StoreResult<CompanyMetric> {
    let value: Json<MetricValue> = row.try_get("value_json")?;
    Ok(CompanyMetric {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        run_id: row.try_get("run_id")?,
        prospect_id: row.try_get("prospect_id")?,
        metric_key: row.try_get("metric_key")?,
        value: value.0,
        currency: row.try_get("currency")?,
        unit: row.try_get("unit")?,
        as_of_date: row.try_get("as_of_date")?,
        confidence: row.try_get("confidence")?,
        source_document_id: row.try_get("source_document_id")?,
        dedup_key: row.try_get("dedup_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn alias_from_row(row: &PgRow) -> StoreResult<CompanyAlias> {
    Ok(CompanyAlias {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        prospect_id: row.try_get("prospect_id")?,
        alias_name: row.try_get("alias_name")?,
        alias_type: row.try_get("alias_type")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
    })
}

fn evidence_from_row(row: &PgRow) -> StoreResult<CompanyProspectEvidence> {
    Ok(CompanyProspectEvidence {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        prospect_id: row.try_get("prospect_id")?,
        source_document_id: row.try_get("source_document_id")?,
        source_content_hash: row.try_get("source_content_hash")?,
        source_type: row.try_get("source_type")?,
        source_url: row.try_get("source_url")?,
        raw_snippet: row.try_get("raw_snippet")?,
        evidence_weight: row.try_get("evidence_weight")?,
        created_at: row.try_get("created_at")?,
    })
}

const CANONICAL_COLUMNS: &str =
    "c.id, c.tenant_id, c.canonical_name, c.name_normalized, c.primary_domain, c.country_code, c.created_at, c.updated_at";

fn canonical_from_row(row: &PgRow) -> StoreResult<CanonicalCompany> {
    Ok(CanonicalCompany {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        canonical_name: row.try_get("canonical_name")?,
        name_normalized: row.try_get("name_normalized")?,
        primary_domain: row.try_get("primary_domain")?,
        country_code: row.try_get("country_code")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn domain_from_row(row: &PgRow) -> StoreResult<CanonicalCompanyDomain> {
    Ok(CanonicalCompanyDomain {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        canonical_company_id: row.try_get("canonical_company_id")?,
        domain: row.try_get("domain")?,
        created_at: row.try_get("created_at")?,
    })
}

const LINK_COLUMNS: &str = "id, tenant_id, canonical_company_id, company_entity_id, match_rule, \
     evidence_source_document_id, evidence_run_id, created_at, updated_at";

fn link_from_row(row: &PgRow) -> StoreResult<CanonicalCompanyLink> {
    let rule: String = row.try_get("match_rule")?;
    Ok(CanonicalCompanyLink {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        canonical_company_id: row.try_get("canonical_company_id")?,
        company_entity_id: row.try_get("company_entity_id")?,
        match_rule: parse_with("canonical_company_links", &rule, MatchRule::parse)?,
        evidence_source_document_id: row.try_get("evidence_source_document_id")?,
        evidence_run_id: row.try_get("evidence_run_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: impl Fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn insert_run(&mut self, run: &ResearchRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_runs
                (id, tenant_id, objective, status, bundle_sha256, plan_json, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(&run.objective)
        .bind(run.status.as_str())
        .bind(&run.bundle_sha256)
        .bind(&run.plan_json)
        .bind(&run.last_error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Option<ResearchRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM research_runs WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(&mut self, run: &ResearchRun) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE research_runs
               SET objective = $2, status = $3, bundle_sha256 = $4, plan_json = $5,
                   last_error = $6, updated_at = $7
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(&run.objective)
        .bind(run.status.as_str())
        .bind(&run.bundle_sha256)
        .bind(&run.plan_json)
        .bind(&run.last_error)
        .bind(run.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_bundle(&mut self, bundle: &ResearchRunBundle) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO research_run_bundles (id, tenant_id, run_id, bundle_sha256, bundle_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(bundle.id)
        .bind(bundle.tenant_id)
        .bind(bundle.run_id)
        .bind(&bundle.bundle_sha256)
        .bind(&bundle.bundle_json)
        .bind(bundle.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn find_bundle(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        bundle_sha256: &str,
    ) -> StoreResult<Option<ResearchRunBundle>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, run_id, bundle_sha256, bundle_json, created_at
              FROM research_run_bundles
             WHERE tenant_id = $1 AND run_id = $2 AND bundle_sha256 = $3
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(bundle_sha256)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    async fn upsert_run_step(&mut self, step: &ResearchRunStep) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_run_steps
                (id, tenant_id, run_id, step_key, step_type, status, inputs_json, outputs_json,
                 provider_meta, started_at, finished_at, output_sha256, error, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (tenant_id, run_id, step_key) DO UPDATE
               SET step_type = EXCLUDED.step_type,
                   status = EXCLUDED.status,
                   inputs_json = EXCLUDED.inputs_json,
                   outputs_json = EXCLUDED.outputs_json,
                   provider_meta = EXCLUDED.provider_meta,
                   started_at = EXCLUDED.started_at,
                   finished_at = EXCLUDED.finished_at,
                   output_sha256 = EXCLUDED.output_sha256,
                   error = EXCLUDED.error,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(step.id)
        .bind(step.tenant_id)
        .bind(step.run_id)
        .bind(&step.step.step_key)
        .bind(enum_text(&step.step.step_type)?)
        .bind(enum_text(&step.step.status)?)
        .bind(&step.step.inputs_json)
        .bind(&step.step.outputs_json)
        .bind(&step.step.provider_meta)
        .bind(step.step.started_at)
        .bind(step.step.finished_at)
        .bind(&step.step.output_sha256)
        .bind(&step.step.error)
        .bind(step.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_run_steps(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchRunStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, run_id, step_key, step_type, status, inputs_json, outputs_json,
                   provider_meta, started_at, finished_at, output_sha256, error, updated_at
              FROM research_run_steps
             WHERE tenant_id = $1 AND run_id = $2
             ORDER BY step_key
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, step_from_row)
    }

    async fn insert_job(&mut self, job: &ResearchJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_jobs
                (id, tenant_id, run_id, job_type, status, attempts, max_attempts, retry_at,
                 locked_by, locked_at, payload, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.run_id)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.retry_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(&job.payload)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn claim_next_job(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<ResearchJob>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|err| corrupt("research_jobs", format!("lease out of range: {err}")))?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE research_jobs
               SET status = 'running', locked_by = $1, locked_at = $2, updated_at = $2
             WHERE id = (
                   SELECT id FROM research_jobs
                    WHERE (status = 'queued' AND (retry_at IS NULL OR retry_at <= $2))
                       OR (status = 'running' AND (locked_at IS NULL OR locked_at < $3))
                    ORDER BY created_at, id
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .bind(now - lease)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job(&mut self, job_id: Uuid) -> StoreResult<Option<ResearchJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM research_jobs WHERE id = $1 FOR UPDATE"))
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&mut self, job: &ResearchJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE research_jobs
               SET status = $2, attempts = $3, max_attempts = $4, retry_at = $5, locked_by = $6,
                   locked_at = $7, payload = $8, last_error = $9, updated_at = $10
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.retry_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(&job.payload)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_jobs_for_run(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM research_jobs WHERE tenant_id = $1 AND run_id = $2 ORDER BY created_at, id"
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, job_from_row)
    }

    async fn insert_source(&mut self, source: &SourceDocument) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(&format!(
            r#"
            INSERT INTO source_documents ({SOURCE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#
        ))
        .bind(source.id)
        .bind(source.tenant_id)
        .bind(source.run_id)
        .bind(source.origin.as_str())
        .bind(&source.url)
        .bind(&source.url_normalized)
        .bind(&source.title)
        .bind(&source.mime_type)
        .bind(source.status.as_str())
        .bind(source.failure_kind.map(FailureKind::as_str))
        .bind(source.attempt_count)
        .bind(source.next_retry_at)
        .bind(source.http_status_code)
        .bind(&source.content_hash)
        .bind(&source.content_text)
        .bind(source.fetched_at)
        .bind(&source.last_error)
        .bind(Json(&source.validators))
        .bind(Json(&source.meta))
        .bind(source.created_at)
        .bind(source.updated_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn find_source_by_hash(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        content_hash: &str,
    ) -> StoreResult<Option<SourceDocument>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM source_documents
             WHERE tenant_id = $1 AND run_id = $2 AND content_hash = $3
             ORDER BY created_at, id
             LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .bind(run_id)
        .bind(content_hash)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn find_source_by_url(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        url_normalized: &str,
    ) -> StoreResult<Option<SourceDocument>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM source_documents
             WHERE tenant_id = $1 AND run_id = $2 AND origin = 'url' AND url_normalized = $3
            "#
        ))
        .bind(tenant_id)
        .bind(run_id)
        .bind(url_normalized)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn get_source(&mut self, source_id: Uuid) -> StoreResult<Option<SourceDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_documents WHERE id = $1 FOR UPDATE"
        ))
        .bind(source_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<SourceDocument>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM source_documents
             WHERE tenant_id = $1 AND run_id = $2
             ORDER BY created_at, id
            "#
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, source_from_row)
    }

    async fn update_source(&mut self, source: &SourceDocument) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE source_documents
               SET url = $2, url_normalized = $3, title = $4, mime_type = $5, status = $6,
                   failure_kind = $7, attempt_count = $8, next_retry_at = $9, http_status_code = $10,
                   content_hash = $11, content_text = $12, fetched_at = $13, last_error = $14,
                   validators = $15, meta = $16, updated_at = $17
             WHERE id = $1
            "#,
        )
        .bind(source.id)
        .bind(&source.url)
        .bind(&source.url_normalized)
        .bind(&source.title)
        .bind(&source.mime_type)
        .bind(source.status.as_str())
        .bind(source.failure_kind.map(FailureKind::as_str))
        .bind(source.attempt_count)
        .bind(source.next_retry_at)
        .bind(source.http_status_code)
        .bind(&source.content_hash)
        .bind(&source.content_text)
        .bind(source.fetched_at)
        .bind(&source.last_error)
        .bind(Json(&source.validators))
        .bind(Json(&source.meta))
        .bind(source.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn append_event(&mut self, event: &ResearchEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO research_events
                (id, tenant_id, run_id, event_type, status, input, output, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.run_id)
        .bind(&event.event_type)
        .bind(event.status.as_str())
        .bind(&event.input)
        .bind(&event.output)
        .bind(&event.error_message)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_events(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<ResearchEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, run_id, event_type, status, input, output, error_message, created_at
              FROM research_events
             WHERE tenant_id = $1 AND run_id = $2
             ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, event_from_row)
    }

    async fn find_prospect(
        &mut self,
        tenant_id: Uuid,
        run_id: Uuid,
        name_normalized: &str,
    ) -> StoreResult<Option<CompanyProspect>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PROSPECT_COLUMNS} FROM company_prospects
             WHERE tenant_id = $1 AND run_id = $2 AND name_normalized = $3
             FOR UPDATE
            "#
        ))
        .bind(tenant_id)
        .bind(run_id)
        .bind(name_normalized)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(prospect_from_row).transpose()
    }

    async fn insert_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO company_prospects ({PROSPECT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#
        ))
        .bind(prospect.id)
        .bind(prospect.tenant_id)
        .bind(prospect.run_id)
        .bind(&prospect.name_raw)
        .bind(&prospect.name_normalized)
        .bind(&prospect.website_url)
        .bind(&prospect.hq_country)
        .bind(&prospect.hq_city)
        .bind(&prospect.sector)
        .bind(&prospect.description)
        .bind(prospect.ai_rank)
        .bind(prospect.ai_score)
        .bind(prospect.created_at)
        .bind(prospect.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_prospect(&mut self, prospect: &CompanyProspect) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE company_prospects
               SET name_raw = $2, website_url = $3, hq_country = $4, hq_city = $5, sector = $6,
                   description = $7, ai_rank = $8, ai_score = $9, updated_at = $10
             WHERE id = $1
            "#,
        )
        .bind(prospect.id)
        .bind(&prospect.name_raw)
        .bind(&prospect.website_url)
        .bind(&prospect.hq_country)
        .bind(&prospect.hq_city)
        .bind(&prospect.sector)
        .bind(&prospect.description)
        .bind(prospect.ai_rank)
        .bind(prospect.ai_score)
        .bind(prospect.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_prospects(&mut self, tenant_id: Uuid, run_id: Uuid) -> StoreResult<Vec<CompanyProspect>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROSPECT_COLUMNS} FROM company_prospects
             WHERE tenant_id = $1 AND run_id = $2
             ORDER BY created_at, id
            "#
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, prospect_from_row)
    }

    async fn list_tenant_prospects(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CompanyProspect>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROSPECT_COLUMNS} FROM company_prospects
             WHERE tenant_id = $1
             ORDER BY created_at, id
            "#
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, prospect_from_row)
    }

    async fn insert_metric(&mut self, metric: &CompanyMetric) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO company_metrics
                (id, tenant_id, run_id, prospect_id, metric_key, metric_type, value_json, currency,
                 unit, as_of_date, confidence, source_document_id, dedup_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(metric.id)
        .bind(metric.tenant_id)
        .bind(metric.run_id)
        .bind(metric.prospect_id)
        .bind(&metric.metric_key)
        .bind(metric.value.metric_type().as_str())
        .bind(Json(&metric.value))
        .bind(&metric.currency)
        .bind(&metric.unit)
        .bind(metric.as_of_date)
        .bind(metric.confidence)
        .bind(metric.source_document_id)
        .bind(&metric.dedup_key)
        .bind(metric.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn list_metrics(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, run_id, prospect_id, metric_key, value_json, currency, unit,
                   as_of_date, confidence, source_document_id, dedup_key, created_at
              FROM company_metrics
             WHERE prospect_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(prospect_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, metric_from_row)
    }

    async fn insert_alias(&mut self, alias: &CompanyAlias) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO company_aliases (id, tenant_id, prospect_id, alias_name, alias_type, confidence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(alias.id)
        .bind(alias.tenant_id)
        .bind(alias.prospect_id)
        .bind(&alias.alias_name)
        .bind(&alias.alias_type)
        .bind(alias.confidence)
        .bind(alias.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn list_aliases(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyAlias>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, prospect_id, alias_name, alias_type, confidence, created_at
              FROM company_aliases
             WHERE prospect_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(prospect_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, alias_from_row)
    }

    async fn insert_evidence(&mut self, evidence: &CompanyProspectEvidence) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO company_prospect_evidence
                (id, tenant_id, prospect_id, source_document_id, source_content_hash, source_type,
                 source_url, raw_snippet, evidence_weight, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(evidence.id)
        .bind(evidence.tenant_id)
        .bind(evidence.prospect_id)
        .bind(evidence.source_document_id)
        .bind(&evidence.source_content_hash)
        .bind(&evidence.source_type)
        .bind(&evidence.source_url)
        .bind(&evidence.raw_snippet)
        .bind(evidence.evidence_weight)
        .bind(evidence.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn list_evidence(&mut self, prospect_id: Uuid) -> StoreResult<Vec<CompanyProspectEvidence>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, prospect_id, source_document_id, source_content_hash, source_type,
                   source_url, raw_snippet, evidence_weight, created_at
              FROM company_prospect_evidence
             WHERE prospect_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(prospect_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, evidence_from_row)
    }

    async fn find_canonical_by_domain(
        &mut self,
        tenant_id: Uuid,
        domain: &str,
    ) -> StoreResult<Option<CanonicalCompany>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CANONICAL_COLUMNS}
              FROM canonical_company_domains d
              JOIN canonical_companies c ON c.id = d.canonical_company_id
             WHERE d.tenant_id = $1 AND d.domain = $2
            "#
        ))
        .bind(tenant_id)
        .bind(domain)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(canonical_from_row).transpose()
    }

    async fn find_canonical_by_name_country(
        &mut self,
        tenant_id: Uuid,
        name_normalized: &str,
        country_code: &str,
    ) -> StoreResult<Option<CanonicalCompany>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CANONICAL_COLUMNS}
              FROM canonical_companies c
             WHERE c.tenant_id = $1 AND c.primary_domain IS NULL
               AND c.name_normalized = $2 AND c.country_code = $3
             ORDER BY c.created_at, c.id
             LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .bind(name_normalized)
        .bind(country_code)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(canonical_from_row).transpose()
    }

    async fn insert_canonical(&mut self, company: &CanonicalCompany) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO canonical_companies
                (id, tenant_id, canonical_name, name_normalized, primary_domain, country_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(company.id)
        .bind(company.tenant_id)
        .bind(&company.canonical_name)
        .bind(&company.name_normalized)
        .bind(&company.primary_domain)
        .bind(&company.country_code)
        .bind(company.created_at)
        .bind(company.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_canonical(&mut self, tenant_id: Uuid, id: Uuid) -> StoreResult<Option<CanonicalCompany>> {
        let row = sqlx::query(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_companies c WHERE c.tenant_id = $1 AND c.id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(canonical_from_row).transpose()
    }

    async fn list_canonicals(&mut self, tenant_id: Uuid) -> StoreResult<Vec<CanonicalCompany>> {
        let rows = sqlx::query(&format!(
            "SELECT {CANONICAL_COLUMNS} FROM canonical_companies c WHERE c.tenant_id = $1 ORDER BY c.created_at, c.id"
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, canonical_from_row)
    }

    async fn insert_canonical_domain(&mut self, domain: &CanonicalCompanyDomain) -> StoreResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO canonical_company_domains (id, tenant_id, canonical_company_id, domain, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, domain) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(domain.id)
        .bind(domain.tenant_id)
        .bind(domain.canonical_company_id)
        .bind(&domain.domain)
        .bind(domain.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(inserted.is_some())
    }

    async fn list_canonical_domains(&mut self, canonical_company_id: Uuid) -> StoreResult<Vec<CanonicalCompanyDomain>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, canonical_company_id, domain, created_at
              FROM canonical_company_domains
             WHERE canonical_company_id = $1
             ORDER BY domain
            "#,
        )
        .bind(canonical_company_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, domain_from_row)
    }

    async fn find_link(
        &mut self,
        canonical_company_id: Uuid,
        company_entity_id: Uuid,
    ) -> StoreResult<Option<CanonicalCompanyLink>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {LINK_COLUMNS} FROM canonical_company_links
             WHERE canonical_company_id = $1 AND company_entity_id = $2
            "#
        ))
        .bind(canonical_company_id)
        .bind(company_entity_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn upsert_link(&mut self, link: &CanonicalCompanyLink) -> StoreResult<bool> {
        let created = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO canonical_company_links
                (id, tenant_id, canonical_company_id, company_entity_id, match_rule,
                 evidence_source_document_id, evidence_run_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (canonical_company_id, company_entity_id) DO UPDATE
               SET match_rule = EXCLUDED.match_rule,
                   evidence_source_document_id = EXCLUDED.evidence_source_document_id,
                   evidence_run_id = EXCLUDED.evidence_run_id,
                   updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(link.id)
        .bind(link.tenant_id)
        .bind(link.canonical_company_id)
        .bind(link.company_entity_id)
        .bind(link.match_rule.as_str())
        .bind(link.evidence_source_document_id)
        .bind(link.evidence_run_id)
        .bind(link.created_at)
        .bind(link.updated_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn list_links(
        &mut self,
        tenant_id: Uuid,
        canonical_company_id: Option<Uuid>,
    ) -> StoreResult<Vec<CanonicalCompanyLink>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LINK_COLUMNS} FROM canonical_company_links
             WHERE tenant_id = $1 AND ($2::uuid IS NULL OR canonical_company_id = $2)
             ORDER BY created_at, id
            "#
        ))
        .bind(tenant_id)
        .bind(canonical_company_id)
        .fetch_all(&mut *self.tx)
        .await?;
        collect(rows, link_from_row)
    }
}
