//! URL source attachment and acquisition.
//!
//! Fetches run with no store transaction open. Each outcome is written back
//! in its own short transaction keyed by source id, so a late result from a
//! worker that lost its lease only rewrites the same row.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rip_core::normalize::canonicalize_url;
use rip_core::{sha256_hex, EventStatus, FailureKind, ResearchEvent, SourceDocument, SourceStatus};
use rip_fetch::{extension_for_mime, mime_essence, FetchFailure, FetchOutcome, FetchResult, FetchedBody};
use rip_store::StoreTx;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::apply_extraction;
use crate::{record_event, Pipeline, PipelineError, PipelineResult, JOB_INGEST_RUN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidUrl {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddSourcesResult {
    pub added: usize,
    pub existing: usize,
    pub invalid: Vec<InvalidUrl>,
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionSummary {
    pub attempted: usize,
    pub fetched: usize,
    pub not_modified: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    /// Earliest retry time of a source still inside its backoff window.
    pub waiting_until: Option<DateTime<Utc>>,
}

enum Applied {
    Fetched,
    NotModified,
    RetryScheduled,
    Failed,
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

impl Pipeline {
    /// Attaches URLs to the run and enqueues an acquisition job.
    pub async fn add_url_sources(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
        urls: &[String],
    ) -> PipelineResult<AddSourcesResult> {
        if urls.is_empty() {
            return Err(PipelineError::InvalidInput("urls must not be empty".to_string()));
        }

        let mut tx = self.store.begin().await?;
        if tx.get_run(tenant_id, run_id).await?.is_none() {
            return Err(PipelineError::RunNotFound(run_id));
        }

        let mut result = AddSourcesResult::default();
        let now = Utc::now();
        for url in urls {
            let url = url.trim();
            match canonicalize_url(url) {
                Ok(url_normalized) => {
                    let source = SourceDocument::pending_url(tenant_id, run_id, url, url_normalized, now);
                    if tx.insert_source(&source).await? {
                        result.added += 1;
                    } else {
                        result.existing += 1;
                    }
                }
                Err(err) => result.invalid.push(InvalidUrl {
                    url: url.to_string(),
                    error: err.to_string(),
                }),
            }
        }

        if result.added + result.existing == 0 {
            let reasons = result
                .invalid
                .iter()
                .map(|i| format!("{}: {}", i.url, i.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::InvalidInput(format!("no valid urls ({reasons})")));
        }

        let job_id = self
            .queue
            .enqueue_in(tx.as_mut(), tenant_id, run_id, JOB_INGEST_RUN, json!({}))
            .await?;
        result.job_id = Some(job_id);
        record_event(
            tx.as_mut(),
            tenant_id,
            run_id,
            "sources_added",
            EventStatus::Ok,
            json!({ "urls": urls }),
            json!({ "added": result.added, "existing": result.existing, "invalid": result.invalid, "job_id": job_id }),
        )
        .await?;
        tx.commit().await?;

        info!(%run_id, added = result.added, existing = result.existing, %job_id, "url sources attached");
        Ok(result)
    }

    /// Fetches every due URL source of the run and records the outcomes.
    pub async fn acquire_sources(&self, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<AcquisitionSummary> {
        let due = self.claim_due_sources(tenant_id, run_id).await?;
        let mut summary = AcquisitionSummary {
            attempted: due.len(),
            ..AcquisitionSummary::default()
        };

        if !due.is_empty() {
            let concurrency = self.fetcher.config().global_concurrency.max(1);
            let outcomes: Vec<(SourceDocument, FetchOutcome)> = stream::iter(due)
                .map(|source| {
                    let fetcher = self.fetcher.clone();
                    async move {
                        let url = source.url.clone().unwrap_or_default();
                        let outcome = fetcher.fetch(run_id, &url, &source.validators).await;
                        (source, outcome)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            // One bad write must not strand the other sources in `fetching`.
            let mut first_error = None;
            for (source, outcome) in outcomes {
                match self.apply_outcome(source.id, outcome).await {
                    Ok(Some(Applied::Fetched)) => summary.fetched += 1,
                    Ok(Some(Applied::NotModified)) => summary.not_modified += 1,
                    Ok(Some(Applied::RetryScheduled)) => summary.retry_scheduled += 1,
                    Ok(Some(Applied::Failed)) => summary.failed += 1,
                    Ok(None) => {}
                    Err(err) => {
                        error!(%run_id, source_id = %source.id, error = %err, "recording fetch outcome failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        let mut tx = self.store.begin().await?;
        let now = Utc::now();
        summary.waiting_until = tx
            .list_sources(tenant_id, run_id)
            .await?
            .iter()
            .filter_map(|s| s.waiting_retry_at(now))
            .min();
        drop(tx);

        if summary.attempted > 0 {
            info!(
                %run_id,
                attempted = summary.attempted,
                fetched = summary.fetched,
                not_modified = summary.not_modified,
                retry_scheduled = summary.retry_scheduled,
                failed = summary.failed,
                "sources acquired"
            );
        }
        Ok(summary)
    }

    async fn claim_due_sources(&self, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<Vec<SourceDocument>> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut due = Vec::new();
        for mut source in tx.list_sources(tenant_id, run_id).await? {
            if !source.is_due_for_fetch(now) {
                continue;
            }
            if source.content_hash.is_none() && source.status != SourceStatus::Fetching {
                source.status = SourceStatus::Fetching;
                source.updated_at = now;
                tx.update_source(&source).await?;
            }
            due.push(source);
        }
        tx.commit().await?;
        Ok(due)
    }

    async fn apply_outcome(&self, source_id: Uuid, outcome: FetchOutcome) -> PipelineResult<Option<Applied>> {
        let mut tx = self.store.begin().await?;
        let Some(mut source) = tx.get_source(source_id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let (tenant_id, run_id) = (source.tenant_id, source.run_id);

        let failure_message = outcome.failure().map(|f| f.message.clone());
        for event in &outcome.events {
            let mut row = ResearchEvent::new(
                tenant_id,
                run_id,
                event.event_type,
                event.status,
                event.input.clone(),
                event.output.clone(),
            );
            if event.status == EventStatus::Failed {
                if let Some(message) = &failure_message {
                    row = row.with_error(message.clone());
                }
            }
            tx.append_event(&row).await?;
        }

        source.meta.redirect_chain = outcome.redirect_chain.clone();
        source.meta.canonical_final_url = outcome.canonical_final_url.clone();

        let applied = match &outcome.result {
            FetchResult::Fetched(body) => {
                self.apply_body(tx.as_mut(), &mut source, body, now).await?;
                Applied::Fetched
            }
            FetchResult::NotModified { .. } => {
                source.status = SourceStatus::Fetched;
                source.failure_kind = None;
                source.next_retry_at = None;
                source.last_error = None;
                source.validators.pending_recheck = false;
                source.validators.last_checked_at = Some(now);
                Applied::NotModified
            }
            FetchResult::Failed(failure) => self.apply_failure(tx.as_mut(), &mut source, failure, now).await?,
        };

        source.updated_at = now;
        tx.update_source(&source).await?;
        tx.commit().await?;
        Ok(Some(applied))
    }

    async fn apply_body(
        &self,
        tx: &mut dyn StoreTx,
        source: &mut SourceDocument,
        body: &FetchedBody,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let mime = mime_essence(&body.content_type);
        let artifact = self
            .artifacts
            .store_bytes(source.run_id, extension_for_mime(&mime), &body.body)
            .await?;

        if source.meta.retry_after_pending {
            record_event(
                tx,
                source.tenant_id,
                source.run_id,
                "retry_after_honored",
                EventStatus::Ok,
                json!({ "source_id": source.id, "url": source.url }),
                json!({ "scheduled_at": source.next_retry_at, "fetched_at": now }),
            )
            .await?;
            source.meta.retry_after_pending = false;
        }

        source.status = SourceStatus::Fetched;
        source.failure_kind = None;
        source.next_retry_at = None;
        source.last_error = None;
        source.http_status_code = Some(i32::from(body.status));
        source.mime_type = Some(mime.clone());
        source.content_hash = Some(sha256_hex(&body.body));
        source.fetched_at = Some(now);
        source.validators.etag = body.etag.clone();
        source.validators.last_modified = body.last_modified.clone();
        source.validators.pending_recheck = true;
        source.validators.last_checked_at = Some(now);
        source.meta.bytes_read = Some(body.body.len() as u64);
        source.meta.artifact_path = Some(artifact.relative_path.to_string_lossy().into_owned());

        if let Some(extraction) = apply_extraction(source, &body.body, &mime, &self.classifier) {
            source.content_text = Some(extraction.text);
        }

        record_event(
            tx,
            source.tenant_id,
            source.run_id,
            "source_fetched",
            EventStatus::Ok,
            json!({ "source_id": source.id, "url": source.url }),
            json!({
                "content_hash": source.content_hash,
                "bytes": body.body.len(),
                "artifact_path": source.meta.artifact_path,
                "deduplicated_artifact": artifact.deduplicated,
                "decision": source.meta.extraction.as_ref().map(|m| m.decision.as_str()),
            }),
        )
        .await?;
        Ok(())
    }

    async fn apply_failure(
        &self,
        tx: &mut dyn StoreTx,
        source: &mut SourceDocument,
        failure: &FetchFailure,
        now: DateTime<Utc>,
    ) -> PipelineResult<Applied> {
        let code = failure.code.as_str();
        let had_content = source.content_hash.is_some();
        source.attempt_count += 1;
        source.http_status_code = failure.http_status.map(i32::from);
        if failure.bytes_read.is_some() {
            source.meta.bytes_read = failure.bytes_read;
        }

        let retry = failure.kind == FailureKind::Retryable && source.attempt_count < self.fetch_retry.max_attempts;
        if retry {
            let delay = failure
                .retry_after
                .unwrap_or_else(|| self.fetch_retry.backoff.delay_after_attempts(source.attempt_count));
            let retry_at = now + to_chrono(delay);
            source.failure_kind = Some(FailureKind::Retryable);
            source.next_retry_at = Some(retry_at);
            source.last_error = Some(code.to_string());
            source.meta.retry_after_pending = failure.retry_after.is_some();
            if !had_content {
                source.status = SourceStatus::Failed;
            }
            record_event(
                tx,
                source.tenant_id,
                source.run_id,
                "source_retry_scheduled",
                EventStatus::Warn,
                json!({ "source_id": source.id, "url": source.url }),
                json!({
                    "code": code,
                    "attempt_count": source.attempt_count,
                    "next_retry_at": retry_at,
                    "retry_after_seconds": failure.retry_after.map(|d| d.as_secs()),
                }),
            )
            .await?;
            warn!(source_id = %source.id, code, attempt = source.attempt_count, %retry_at, "source fetch will be retried");
            return Ok(Applied::RetryScheduled);
        }

        let last_error = if failure.kind == FailureKind::Retryable {
            format!("attempts_exhausted:{code}")
        } else {
            code.to_string()
        };
        source.failure_kind = Some(FailureKind::Terminal);
        source.next_retry_at = None;
        source.meta.retry_after_pending = false;
        source.validators.pending_recheck = false;
        source.last_error = Some(last_error.clone());
        if !had_content {
            source.status = SourceStatus::Failed;
        }
        tx.append_event(
            &ResearchEvent::new(
                source.tenant_id,
                source.run_id,
                "source_failed",
                EventStatus::Failed,
                json!({ "source_id": source.id, "url": source.url }),
                json!({ "code": code, "attempt_count": source.attempt_count, "http_status": failure.http_status }),
            )
            .with_error(last_error.clone()),
        )
        .await?;
        warn!(source_id = %source.id, error = %last_error, "source fetch failed permanently");
        Ok(Applied::Failed)
    }
}
