use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use rip_core::normalize::canonicalize_url;
use rip_core::{BackoffPolicy, EventStatus, JobStatus, ResearchEvent, RunStatus, SourceDocument, SourceStatus};
use rip_fetch::FetchPolicyConfig;
use rip_pipeline::{JobDisposition, Pipeline, PipelineConfig, PipelineError, Worker, JOB_INGEST_RUN};
use rip_store::{MemoryStore, QueueConfig, ResearchStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

async fn spawn(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    store: MemoryStore,
    pipeline: Arc<Pipeline>,
    worker: Worker,
    tenant_id: Uuid,
    run_id: Uuid,
    artifacts: TempDir,
}

impl Harness {
    async fn new(fetch: FetchPolicyConfig) -> Self {
        let artifacts = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            artifacts_dir: artifacts.path().to_path_buf(),
            fetch,
            ..PipelineConfig::default()
        };
        Self::with_config(config, artifacts).await
    }

    /// Artifact root is a plain file, so every body write fails. Failed jobs
    /// are claimable again at once.
    async fn with_unwritable_artifacts() -> Self {
        let artifacts = tempfile::tempdir().unwrap();
        let blocked = artifacts.path().join("artifacts");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let config = PipelineConfig {
            artifacts_dir: blocked,
            queue: QueueConfig {
                backoff: BackoffPolicy {
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                },
                ..QueueConfig::default()
            },
            ..PipelineConfig::default()
        };
        Self::with_config(config, artifacts).await
    }

    async fn with_config(config: PipelineConfig, artifacts: TempDir) -> Self {
        let store = MemoryStore::new();
        let pipeline = Arc::new(Pipeline::new(Arc::new(store.clone()), &config).unwrap());
        let worker = Worker::new(pipeline.clone(), "acquisition-test", Duration::from_millis(10));
        let tenant_id = Uuid::new_v4();
        let run_id = pipeline.create_run(tenant_id, "port operators").await.unwrap().id;
        Self {
            store,
            pipeline,
            worker,
            tenant_id,
            run_id,
            artifacts,
        }
    }

    async fn events(&self, event_type: &str) -> Vec<ResearchEvent> {
        let mut tx = self.store.begin().await.unwrap();
        tx.list_events(self.tenant_id, self.run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[tokio::test]
async fn retry_after_is_honored_before_the_next_attempt() {
    let hits: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let seen = hits.clone();
    let router = Router::new().route(
        "/report",
        get(move || {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock().await;
                seen.push(Instant::now());
                if seen.len() == 1 {
                    return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")], "slow down").into_response();
                }
                ([(header::CONTENT_TYPE, "text/plain")], "Port throughput report for 2024.").into_response()
            }
        }),
    );
    let base = spawn(router).await;
    let h = Harness::new(FetchPolicyConfig::default()).await;

    h.pipeline
        .add_url_sources(h.tenant_id, h.run_id, &[format!("{base}/report")])
        .await
        .unwrap();

    let first = h.worker.run_once().await.unwrap().unwrap();
    assert!(matches!(first.disposition, JobDisposition::Rescheduled { .. }));
    {
        let mut tx = h.store.begin().await.unwrap();
        let source = &tx.list_sources(h.tenant_id, h.run_id).await.unwrap()[0];
        assert_eq!(source.status, SourceStatus::Failed);
        assert_eq!(source.attempt_count, 1);
        assert!(source.meta.retry_after_pending);
    }
    assert_eq!(h.events("source_retry_scheduled").await.len(), 1);

    // Too early: the job is not claimable yet.
    assert_eq!(h.worker.run_once().await.unwrap(), None);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = h.worker.run_once().await.unwrap().unwrap();
    assert_eq!(second.disposition, JobDisposition::Succeeded);

    let hits = hits.lock().await;
    assert_eq!(hits.len(), 2);
    assert!(hits[1].duration_since(hits[0]) >= Duration::from_secs(1));

    let mut tx = h.store.begin().await.unwrap();
    let source = &tx.list_sources(h.tenant_id, h.run_id).await.unwrap()[0];
    assert_eq!(source.status, SourceStatus::Fetched);
    assert!(!source.meta.retry_after_pending);
    assert_eq!(source.content_text.as_deref(), Some("Port throughput report for 2024."));
    let artifact = source.meta.artifact_path.as_ref().expect("artifact path");
    assert!(h.artifacts.path().join(artifact).exists());
    drop(tx);
    assert_eq!(h.events("retry_after_honored").await.len(), 1);
}

#[tokio::test]
async fn revalidation_uses_the_stored_etag() {
    let router = Router::new().route(
        "/annual",
        get(|headers: HeaderMap| async move {
            if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some("\"r1\"") {
                return StatusCode::NOT_MODIFIED.into_response();
            }
            (
                [(header::CONTENT_TYPE, "text/plain"), (header::ETAG, "\"r1\"")],
                "Annual report body.",
            )
                .into_response()
        }),
    );
    let base = spawn(router).await;
    let h = Harness::new(FetchPolicyConfig::default()).await;
    let urls = [format!("{base}/annual")];

    h.pipeline.add_url_sources(h.tenant_id, h.run_id, &urls).await.unwrap();
    assert_eq!(h.worker.run_once().await.unwrap().unwrap().disposition, JobDisposition::Succeeded);
    let fetched = {
        let mut tx = h.store.begin().await.unwrap();
        tx.list_sources(h.tenant_id, h.run_id).await.unwrap().remove(0)
    };
    assert_eq!(fetched.validators.etag.as_deref(), Some("\"r1\""));
    assert!(fetched.validators.pending_recheck);

    let again = h.pipeline.add_url_sources(h.tenant_id, h.run_id, &urls).await.unwrap();
    assert_eq!((again.added, again.existing), (0, 1));
    assert_eq!(h.worker.run_once().await.unwrap().unwrap().disposition, JobDisposition::Succeeded);

    let mut tx = h.store.begin().await.unwrap();
    let sources = tx.list_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(sources.len(), 1);
    let revalidated = &sources[0];
    assert_eq!(revalidated.status, SourceStatus::Fetched);
    assert_eq!(revalidated.content_hash, fetched.content_hash);
    assert_eq!(revalidated.fetched_at, fetched.fetched_at);
    assert!(!revalidated.validators.pending_recheck);
    assert!(revalidated.validators.last_checked_at >= fetched.validators.last_checked_at);
    drop(tx);
    assert_eq!(h.events("not_modified").await.len(), 1);
    assert_eq!(h.events("source_fetched").await.len(), 1);
}

#[tokio::test]
async fn per_domain_delay_is_recorded_as_an_event() {
    let router = Router::new()
        .route("/a", get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "first page") }))
        .route("/b", get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "second page") }));
    let base = spawn(router).await;
    let h = Harness::new(FetchPolicyConfig {
        per_domain_min_delay: Duration::from_millis(200),
        ..FetchPolicyConfig::default()
    })
    .await;

    h.pipeline
        .add_url_sources(h.tenant_id, h.run_id, &[format!("{base}/a"), format!("{base}/b")])
        .await
        .unwrap();
    let summary = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.waiting_until, None);

    let limited = h.events("domain_rate_limited").await;
    assert!(!limited.is_empty());
    assert!(limited.iter().all(|e| e.status == EventStatus::Warn));
    assert!(limited.iter().any(|e| e.output["waited_ms"].as_u64().unwrap_or(0) > 0));
}

#[tokio::test]
async fn client_error_is_terminal() {
    let router = Router::new().route("/gone", get(|| async { StatusCode::NOT_FOUND }));
    let base = spawn(router).await;
    let h = Harness::new(FetchPolicyConfig::default()).await;

    h.pipeline
        .add_url_sources(h.tenant_id, h.run_id, &[format!("{base}/gone")])
        .await
        .unwrap();
    let summary = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.waiting_until, None);

    let mut tx = h.store.begin().await.unwrap();
    let source = &tx.list_sources(h.tenant_id, h.run_id).await.unwrap()[0];
    assert_eq!(source.status, SourceStatus::Failed);
    assert_eq!(source.http_status_code, Some(404));
    assert!(source.next_retry_at.is_none());
    drop(tx);
    let failed = h.events("source_failed").await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error_message.is_some());
}

#[tokio::test]
async fn invalid_urls_are_reported_and_an_all_invalid_list_is_rejected() {
    let h = Harness::new(FetchPolicyConfig::default()).await;

    let err = h
        .pipeline
        .add_url_sources(h.tenant_id, h.run_id, &["   ".to_string(), "http://".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));

    let mixed = h
        .pipeline
        .add_url_sources(
            h.tenant_id,
            h.run_id,
            &["https://Example.com//a/".to_string(), "http://".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(mixed.added, 1);
    assert_eq!(mixed.invalid.len(), 1);

    let mut tx = h.store.begin().await.unwrap();
    let source = &tx.list_sources(h.tenant_id, h.run_id).await.unwrap()[0];
    assert_eq!(source.url_normalized.as_deref(), Some("https://example.com/a"));
    assert_eq!(source.status, SourceStatus::New);
}

#[tokio::test]
async fn failed_revalidation_waits_out_retry_after() {
    let hits: Arc<Mutex<usize>> = Arc::default();
    let seen = hits.clone();
    let router = Router::new().route(
        "/filing",
        get(move || {
            let seen = seen.clone();
            async move {
                let mut seen = seen.lock().await;
                *seen += 1;
                if *seen == 1 {
                    return ([(header::CONTENT_TYPE, "text/plain"), (header::ETAG, "\"f1\"")], "Quarterly filing.")
                        .into_response();
                }
                (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "120")], "maintenance").into_response()
            }
        }),
    );
    let base = spawn(router).await;
    let h = Harness::new(FetchPolicyConfig::default()).await;
    h.pipeline
        .add_url_sources(h.tenant_id, h.run_id, &[format!("{base}/filing")])
        .await
        .unwrap();

    let first = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(first.fetched, 1);
    let fetched = {
        let mut tx = h.store.begin().await.unwrap();
        tx.list_sources(h.tenant_id, h.run_id).await.unwrap().remove(0)
    };

    let started = Utc::now();
    let second = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(second.retry_scheduled, 1);
    let waiting_until = second.waiting_until.expect("revalidation is waiting");
    assert!(waiting_until >= started + chrono::Duration::seconds(119));

    let third = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap();
    assert_eq!(third.attempted, 0);
    assert_eq!(third.waiting_until, Some(waiting_until));
    assert_eq!(*hits.lock().await, 2);

    let mut tx = h.store.begin().await.unwrap();
    let source = &tx.list_sources(h.tenant_id, h.run_id).await.unwrap()[0];
    assert_eq!(source.status, SourceStatus::Fetched);
    assert_eq!(source.content_hash, fetched.content_hash);
    assert_eq!(source.next_retry_at, Some(waiting_until));
    assert!(source.validators.pending_recheck);
    assert!(source.meta.retry_after_pending);
}

#[tokio::test]
async fn outcome_write_error_still_records_the_other_sources() {
    let router = Router::new()
        .route("/body", get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "needs an artifact") }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
    let base = spawn(router).await;
    let h = Harness::with_unwritable_artifacts().await;
    h.pipeline
        .add_url_sources(h.tenant_id, h.run_id, &[format!("{base}/body"), format!("{base}/missing")])
        .await
        .unwrap();

    let err = h.pipeline.acquire_sources(h.tenant_id, h.run_id).await.unwrap_err();
    assert!(err.to_string().starts_with("creating artifact directory"), "{err}");

    let mut tx = h.store.begin().await.unwrap();
    let sources = tx.list_sources(h.tenant_id, h.run_id).await.unwrap();
    let missing = sources
        .iter()
        .find(|s| s.url.as_deref().is_some_and(|u| u.ends_with("/missing")))
        .unwrap();
    assert_eq!(missing.status, SourceStatus::Failed);
    assert_eq!(missing.http_status_code, Some(404));
    let body = sources
        .iter()
        .find(|s| s.url.as_deref().is_some_and(|u| u.ends_with("/body")))
        .unwrap();
    assert_eq!(body.status, SourceStatus::Fetching);
}

#[tokio::test]
async fn acquisition_error_on_every_attempt_fails_the_bundle_run() {
    let router = Router::new().route(
        "/annex",
        get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "Annex to the bundle.") }),
    );
    let base = spawn(router).await;
    let h = Harness::with_unwritable_artifacts().await;
    let bundle_sha256 = "d".repeat(64);
    let url = format!("{base}/annex");

    let mut tx = h.store.begin().await.unwrap();
    let mut run = tx.get_run(h.tenant_id, h.run_id).await.unwrap().unwrap();
    run.status = RunStatus::Ingesting;
    run.bundle_sha256 = Some(bundle_sha256.clone());
    tx.update_run(&run).await.unwrap();
    let source = SourceDocument::pending_url(h.tenant_id, h.run_id, &url, canonicalize_url(&url).unwrap(), Utc::now());
    tx.insert_source(&source).await.unwrap();
    tx.commit().await.unwrap();
    let job_id = h
        .pipeline
        .queue()
        .enqueue(h.tenant_id, h.run_id, JOB_INGEST_RUN, json!({ "bundle_sha256": bundle_sha256 }))
        .await
        .unwrap();

    for _ in 0..3 {
        let report = h.worker.run_once().await.unwrap().expect("job is claimable");
        assert!(matches!(report.disposition, JobDisposition::Failed { .. }));
    }
    assert_eq!(h.worker.run_once().await.unwrap(), None);

    let mut tx = h.store.begin().await.unwrap();
    let job = tx.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    let run = tx.get_run(h.tenant_id, h.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("creating artifact directory")));
    drop(tx);
    assert!(!h.events("bundle_ingest_failed").await.is_empty());
}

