//! Core domain model for the research ingestion pipeline.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod bundle;
pub mod canonical;
pub mod normalize;
pub mod quality;

pub use bundle::{MetricType, MetricValue, RunBundle, RunStep, ValidationIssue, ValidationReport};
pub use canonical::{canonical_hash, canonicalize, sha256_hex, CanonicalError};
pub use quality::{Decision, ExtractionMeta, QualityFlags, ReasonCode};

pub const CRATE_NAME: &str = "rip-core";

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    NeedsReview,
    Ingesting,
    Submitted,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::NeedsReview => "needs_review",
            Self::Ingesting => "ingesting",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "needs_review" => Some(Self::NeedsReview),
            "ingesting" => Some(Self::Ingesting),
            "submitted" => Some(Self::Submitted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A research run owned by a tenant. Created upstream; the pipeline only
/// transitions its status and records the accepted bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub objective: String,
    pub status: RunStatus,
    pub bundle_sha256: Option<String>,
    pub plan_json: Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchRun {
    pub fn new(tenant_id: Uuid, objective: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            objective: objective.into(),
            status: RunStatus::Created,
            bundle_sha256: None,
            plan_json: empty_object(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub payload: Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchJob {
    pub fn new(
        tenant_id: Uuid,
        run_id: Uuid,
        job_type: impl Into<String>,
        payload: Value,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            job_type: job_type.into(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            retry_at: None,
            locked_by: None,
            locked_at: None,
            payload,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the job may be handed to a claimer at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.status {
            JobStatus::Queued => self.retry_at.map_or(true, |at| at <= now),
            JobStatus::Running => self.locked_at.map_or(true, |at| {
                chrono::Duration::from_std(lease).map_or(false, |lease| at + lease < now)
            }),
            JobStatus::Succeeded | JobStatus::Failed => false,
        }
    }

    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_deref() == Some(worker_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    New,
    Fetching,
    Fetched,
    Failed,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "fetching" => Some(Self::Fetching),
            "fetched" => Some(Self::Fetched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Terminal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retryable" => Some(Self::Retryable),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }
}

/// Where a source document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Bundle,
    Url,
}

impl SourceOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bundle => "bundle",
            Self::Url => "url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bundle" => Some(Self::Bundle),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

/// HTTP cache validators kept between fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub pending_recheck: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectHop {
    pub from: String,
    pub to: String,
    pub status: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMeta {
    pub redirect_chain: Vec<RedirectHop>,
    pub canonical_final_url: Option<String>,
    pub bytes_read: Option<u64>,
    pub artifact_path: Option<String>,
    pub retry_after_pending: bool,
    pub temp_id: Option<String>,
    pub bundle_meta: Option<Value>,
    pub extraction: Option<ExtractionMeta>,
    pub quality_flags: Option<QualityFlags>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub origin: SourceOrigin,
    pub url: Option<String>,
    pub url_normalized: Option<String>,
    pub title: Option<String>,
    pub mime_type: Option<String>,
    pub status: SourceStatus,
    pub failure_kind: Option<FailureKind>,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub http_status_code: Option<i32>,
    pub content_hash: Option<String>,
    pub content_text: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub validators: Validators,
    pub meta: SourceMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceDocument {
    /// A URL attached to a run that still has to be fetched.
    pub fn pending_url(
        tenant_id: Uuid,
        run_id: Uuid,
        url: impl Into<String>,
        url_normalized: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            origin: SourceOrigin::Url,
            url: Some(url.into()),
            url_normalized: Some(url_normalized.into()),
            title: None,
            mime_type: None,
            status: SourceStatus::New,
            failure_kind: None,
            attempt_count: 0,
            next_retry_at: None,
            http_status_code: None,
            content_hash: None,
            content_text: None,
            fetched_at: None,
            last_error: None,
            validators: Validators::default(),
            meta: SourceMeta::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fetch is due: never fetched, awaiting revalidation, or a retry window has passed.
    pub fn is_due_for_fetch(&self, now: DateTime<Utc>) -> bool {
        if self.origin != SourceOrigin::Url {
            return false;
        }
        match self.status {
            SourceStatus::New | SourceStatus::Fetching => true,
            SourceStatus::Fetched => {
                self.validators.pending_recheck && self.next_retry_at.map_or(true, |at| at <= now)
            }
            SourceStatus::Failed => {
                self.failure_kind == Some(FailureKind::Retryable)
                    && self.next_retry_at.map_or(true, |at| at <= now)
            }
        }
    }

    /// Retry time of a source still inside its backoff window, including a
    /// fetched source whose revalidation failed.
    pub fn waiting_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let waiting = match self.status {
            SourceStatus::Failed => self.failure_kind == Some(FailureKind::Retryable),
            SourceStatus::Fetched => self.validators.pending_recheck,
            SourceStatus::New | SourceStatus::Fetching => false,
        };
        if waiting {
            self.next_retry_at.filter(|at| *at > now)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Warn,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "warn" => Some(Self::Warn),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub event_type: String,
    pub status: EventStatus,
    pub input: Value,
    pub output: Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResearchEvent {
    pub fn new(
        tenant_id: Uuid,
        run_id: Uuid,
        event_type: impl Into<String>,
        status: EventStatus,
        input: Value,
        output: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            event_type: event_type.into(),
            status,
            input,
            output,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Verbatim stored upload, one per distinct bundle hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRunBundle {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub bundle_sha256: String,
    pub bundle_json: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRunStep {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub step: RunStep,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProspect {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub name_raw: String,
    pub name_normalized: String,
    pub website_url: Option<String>,
    pub hq_country: Option<String>,
    pub hq_city: Option<String>,
    pub sector: Option<String>,
    pub description: Option<String>,
    pub ai_rank: Option<i32>,
    pub ai_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyMetric {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub prospect_id: Uuid,
    pub metric_key: String,
    pub value: MetricValue,
    pub currency: Option<String>,
    pub unit: Option<String>,
    pub as_of_date: Option<NaiveDate>,
    pub confidence: Option<f64>,
    pub source_document_id: Option<Uuid>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyAlias {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub prospect_id: Uuid,
    pub alias_name: String,
    pub alias_type: String,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProspectEvidence {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub prospect_id: Uuid,
    pub source_document_id: Option<Uuid>,
    pub source_content_hash: Option<String>,
    pub source_type: String,
    pub source_url: Option<String>,
    pub raw_snippet: String,
    pub evidence_weight: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCompany {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub canonical_name: String,
    pub name_normalized: String,
    pub primary_domain: Option<String>,
    pub country_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCompanyDomain {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub canonical_company_id: Uuid,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Domain,
    NameCountry,
}

impl MatchRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::NameCountry => "name_country",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "domain" => Some(Self::Domain),
            "name_country" => Some(Self::NameCountry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCompanyLink {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub canonical_company_id: Uuid,
    pub company_entity_id: Uuid,
    pub match_rule: MatchRule,
    pub evidence_source_document_id: Uuid,
    pub evidence_run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exponential backoff: `base * 2^attempt_index`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay before retry number `attempts` (1-based).
    pub fn delay_after_attempts(&self, attempts: i32) -> Duration {
        self.delay_for_attempt(attempts.max(1) as usize - 1)
    }
}
