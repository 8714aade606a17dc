//! Axum JSON API over the research pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rip_core::{
    CanonicalCompany, CanonicalCompanyDomain, CanonicalCompanyLink, ResearchEvent, ResearchJob, ResearchRun,
    ResearchRunStep, SourceDocument, ValidationIssue,
};
use rip_pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineResult};
use rip_store::{PgStore, ResearchStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rip-web";

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    fn store(&self) -> &Arc<dyn ResearchStore> {
        self.pipeline.store()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", post(create_run_handler))
        .route("/runs/{run_id}", get(run_detail_handler))
        .route("/runs/{run_id}/bundle", post(submit_bundle_handler))
        .route("/runs/{run_id}/approve", post(approve_handler))
        .route("/runs/{run_id}/steps", get(run_steps_handler))
        .route("/runs/{run_id}/sources", post(add_sources_handler))
        .route("/runs/{run_id}/resolve", post(resolve_handler))
        .route("/runs/{run_id}/events", get(run_events_handler))
        .route("/canonical-companies", get(canonical_companies_handler))
        .route("/canonical-companies/{id}", get(canonical_company_handler))
        .route("/canonical-company-links", get(canonical_links_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let store = PgStore::connect(&config.database_url, 10)
        .await
        .context("connecting to the research database")?;
    let pipeline = Pipeline::new(Arc::new(store), &config)?;
    serve(AppState::new(Arc::new(pipeline)), config.web_port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "research api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Opaque tenant id resolved upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenant(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::bad_request("missing_tenant", "x-tenant-id header is required"))?;
        Uuid::parse_str(raw)
            .map(Tenant)
            .map_err(|_| AppError::bad_request("invalid_tenant", "x-tenant-id must be a UUID"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ValidationIssue>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    errors: Vec<ValidationIssue>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
            errors: self.errors,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(report) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "validation_error",
                message: format!("bundle validation failed with {} error(s)", report.errors.len()),
                errors: report.errors,
            },
            PipelineError::RunNotFound(run_id) => Self::not_found(format!("run {run_id} not found")),
            PipelineError::NotReviewable(message) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "not_reviewable", message)
            }
            PipelineError::InvalidInput(message) => Self::bad_request("bad_request", message),
            PipelineError::Ingestion(message) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "ingestion_error", message),
            other => server_error(other),
        }
    }
}

fn server_error(err: impl std::fmt::Display) -> AppError {
    error!(error = %err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value).map_err(|rejection| AppError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        code: "invalid_body",
        message: rejection.body_text(),
        errors: vec![ValidationIssue::new("body", rejection.body_text())],
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub objective: String,
}

#[derive(Debug, Deserialize, Default)]
struct BundleQuery {
    #[serde(default)]
    accept_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddSourcesRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LinksQuery {
    canonical_company_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: ResearchRun,
    pub jobs: Vec<ResearchJob>,
    pub step_counts: BTreeMap<&'static str, usize>,
    pub source_counts: BTreeMap<&'static str, usize>,
}

/// Fetch state of one source, without its text.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFetchState {
    pub id: Uuid,
    pub origin: &'static str,
    pub url: Option<String>,
    pub title: Option<String>,
    pub status: &'static str,
    pub failure_kind: Option<&'static str>,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub http_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub content_hash: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub decision: Option<&'static str>,
}

impl From<&SourceDocument> for SourceFetchState {
    fn from(source: &SourceDocument) -> Self {
        Self {
            id: source.id,
            origin: source.origin.as_str(),
            url: source.url.clone(),
            title: source.title.clone(),
            status: source.status.as_str(),
            failure_kind: source.failure_kind.map(|k| k.as_str()),
            attempt_count: source.attempt_count,
            next_retry_at: source.next_retry_at,
            http_status_code: source.http_status_code,
            last_error: source.last_error.clone(),
            content_hash: source.content_hash.clone(),
            fetched_at: source.fetched_at,
            decision: source.meta.extraction.as_ref().map(|m| m.decision.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSteps {
    pub run_id: Uuid,
    pub steps: Vec<ResearchRunStep>,
    pub sources: Vec<SourceFetchState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalCompanyDetail {
    #[serde(flatten)]
    pub company: CanonicalCompany,
    pub domains: Vec<CanonicalCompanyDomain>,
    pub links: Vec<CanonicalCompanyLink>,
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_run_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ResearchRun>), AppError> {
    let request = json_body(body)?;
    let run = state.pipeline.create_run(tenant_id, &request.objective).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn submit_bundle_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
    Query(query): Query<BundleQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let raw = json_body(body)?;
    let accepted = state.pipeline.accept(tenant_id, run_id, &raw, query.accept_only).await?;
    Ok(Json(json!({
        "run_id": accepted.run_id,
        "bundle_sha256": accepted.bundle_sha256,
        "status": accepted.status,
        "already_accepted": accepted.already_accepted,
        "message": accepted.message,
    })))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let approved = state.pipeline.approve(tenant_id, run_id).await?;
    Ok(Json(json!(approved)))
}

async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunDetail>, AppError> {
    load_run_detail(state.store(), tenant_id, run_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))
}

async fn run_steps_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSteps>, AppError> {
    load_run_steps(state.store(), tenant_id, run_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))
}

async fn add_sources_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
    body: Result<Json<AddSourcesRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let request = json_body(body)?;
    let result = state.pipeline.add_url_sources(tenant_id, run_id, &request.urls).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(result))))
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let job_id = state.pipeline.request_resolve(tenant_id, run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id, "job_id": job_id }))))
}

async fn run_events_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<ResearchEvent>>, AppError> {
    load_run_events(state.store(), tenant_id, run_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("run {run_id} not found")))
}

async fn canonical_companies_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
) -> Result<Json<Vec<CanonicalCompany>>, AppError> {
    let mut tx = state.store().begin().await.map_err(PipelineError::from)?;
    let companies = tx.list_canonicals(tenant_id).await.map_err(PipelineError::from)?;
    Ok(Json(companies))
}

async fn canonical_company_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<CanonicalCompanyDetail>, AppError> {
    load_canonical_company(state.store(), tenant_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("canonical company {id} not found")))
}

async fn canonical_links_handler(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    Query(query): Query<LinksQuery>,
) -> Result<Json<Vec<CanonicalCompanyLink>>, AppError> {
    let mut tx = state.store().begin().await.map_err(PipelineError::from)?;
    let links = tx
        .list_links(tenant_id, query.canonical_company_id)
        .await
        .map_err(PipelineError::from)?;
    Ok(Json(links))
}

pub async fn load_run_detail(
    store: &Arc<dyn ResearchStore>,
    tenant_id: Uuid,
    run_id: Uuid,
) -> PipelineResult<Option<RunDetail>> {
    let mut tx = store.begin().await?;
    let Some(run) = tx.get_run(tenant_id, run_id).await? else {
        return Ok(None);
    };
    let jobs = tx.list_jobs_for_run(tenant_id, run_id).await?;

    let mut step_counts = BTreeMap::new();
    for step in tx.list_run_steps(tenant_id, run_id).await? {
        *step_counts.entry(step.step.status.as_str()).or_insert(0) += 1;
    }
    let mut source_counts = BTreeMap::new();
    for source in tx.list_sources(tenant_id, run_id).await? {
        *source_counts.entry(source.status.as_str()).or_insert(0) += 1;
    }

    Ok(Some(RunDetail {
        run,
        jobs,
        step_counts,
        source_counts,
    }))
}

pub async fn load_run_steps(
    store: &Arc<dyn ResearchStore>,
    tenant_id: Uuid,
    run_id: Uuid,
) -> PipelineResult<Option<RunSteps>> {
    let mut tx = store.begin().await?;
    if tx.get_run(tenant_id, run_id).await?.is_none() {
        return Ok(None);
    }
    let steps = tx.list_run_steps(tenant_id, run_id).await?;
    let sources = tx
        .list_sources(tenant_id, run_id)
        .await?
        .iter()
        .map(SourceFetchState::from)
        .collect();
    Ok(Some(RunSteps { run_id, steps, sources }))
}

pub async fn load_run_events(
    store: &Arc<dyn ResearchStore>,
    tenant_id: Uuid,
    run_id: Uuid,
) -> PipelineResult<Option<Vec<ResearchEvent>>> {
    let mut tx = store.begin().await?;
    if tx.get_run(tenant_id, run_id).await?.is_none() {
        return Ok(None);
    }
    Ok(Some(tx.list_events(tenant_id, run_id).await?))
}

pub async fn load_canonical_company(
    store: &Arc<dyn ResearchStore>,
    tenant_id: Uuid,
    id: Uuid,
) -> PipelineResult<Option<CanonicalCompanyDetail>> {
    let mut tx = store.begin().await?;
    let Some(company) = tx.get_canonical(tenant_id, id).await? else {
        return Ok(None);
    };
    let domains = tx.list_canonical_domains(id).await?;
    let links = tx.list_links(tenant_id, Some(id)).await?;
    Ok(Some(CanonicalCompanyDetail { company, domains, links }))
}
