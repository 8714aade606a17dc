use std::sync::Arc;
use std::time::Duration;

use rip_core::{sha256_hex, EventStatus, JobStatus, RunStatus};
use rip_pipeline::{JobDisposition, Pipeline, PipelineConfig, PipelineError, Worker, JOB_INGEST_RUN};
use rip_store::{MemoryStore, ResearchStore};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

const BODY: &str = "Example content";

struct Harness {
    store: MemoryStore,
    pipeline: Arc<Pipeline>,
    worker: Worker,
    tenant_id: Uuid,
    _artifacts: TempDir,
}

impl Harness {
    fn new() -> Self {
        let artifacts = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            artifacts_dir: artifacts.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let store = MemoryStore::new();
        let pipeline = Arc::new(Pipeline::new(Arc::new(store.clone()), &config).unwrap());
        let worker = Worker::new(pipeline.clone(), "ingestion-test", Duration::from_millis(10));
        Self {
            store,
            pipeline,
            worker,
            tenant_id: Uuid::new_v4(),
            _artifacts: artifacts,
        }
    }

    async fn run(&self) -> Uuid {
        self.pipeline.create_run(self.tenant_id, "logistics in oman").await.unwrap().id
    }

    async fn drain(&self) -> Vec<JobDisposition> {
        let mut dispositions = Vec::new();
        while let Some(report) = self.worker.run_once().await.unwrap() {
            dispositions.push(report.disposition);
        }
        dispositions
    }
}

fn bundle(run_id: Uuid, company: Value) -> Value {
    json!({
        "version": "run_bundle_v1",
        "run_id": run_id,
        "plan_json": { "objective": "logistics in oman" },
        "steps": [
            { "step_key": "search-1", "step_type": "search", "status": "ok" },
            { "step_key": "compose-1", "step_type": "compose", "status": "ok" }
        ],
        "sources": [{
            "sha256": sha256_hex(BODY.as_bytes()),
            "url": "https://acme.example/about",
            "mime_type": "text/plain",
            "content_text": BODY,
            "temp_id": "s1"
        }],
        "proposal_json": {
            "query": "logistics in oman",
            "companies": [company]
        }
    })
}

fn acme() -> Value {
    json!({
        "name": "Acme Logistics LLC",
        "website_url": "https://www.acme.example",
        "hq_country": "OM",
        "aliases": [{ "name": "Acme", "type": "trade" }],
        "metrics": [{
            "key": "Warehouse Count",
            "type": "number",
            "value": 2,
            "source_temp_id": "s1",
            "evidence_snippet": "bonded warehouses in Sohar and Salalah"
        }],
        "evidence_snippets": ["evidence"],
        "source_sha256s": [sha256_hex(BODY.as_bytes())]
    })
}

#[tokio::test]
async fn accepted_bundle_is_ingested_and_resolved_by_the_worker() {
    let h = Harness::new();
    let run_id = h.run().await;

    let accepted = h.pipeline.accept(h.tenant_id, run_id, &bundle(run_id, acme()), false).await.unwrap();
    assert_eq!(accepted.status, RunStatus::Ingesting);
    assert!(!accepted.already_accepted);
    assert!(accepted.job_id.is_some());

    let dispositions = h.drain().await;
    assert_eq!(dispositions, vec![JobDisposition::Succeeded, JobDisposition::Succeeded]);

    let mut tx = h.store.begin().await.unwrap();
    let run = tx.get_run(h.tenant_id, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Submitted);
    let prospects = tx.list_prospects(h.tenant_id, run_id).await.unwrap();
    assert_eq!(prospects.len(), 1);
    assert_eq!(prospects[0].name_normalized, "acme logistics");
    assert_eq!(prospects[0].hq_country.as_deref(), Some("OM"));
    assert_eq!(tx.list_run_steps(h.tenant_id, run_id).await.unwrap().len(), 2);

    let links = tx.list_links(h.tenant_id, None).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].company_entity_id, prospects[0].id);
    let canonical = tx
        .find_canonical_by_domain(h.tenant_id, "acme.example")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(links[0].canonical_company_id, canonical.id);

    let source = tx
        .find_source_by_hash(h.tenant_id, run_id, &sha256_hex(BODY.as_bytes()))
        .await
        .unwrap()
        .unwrap();
    assert!(source.meta.extraction.is_some());
    assert_eq!(links[0].evidence_source_document_id, source.id);
}

#[tokio::test]
async fn same_bundle_twice_writes_nothing_new() {
    let h = Harness::new();
    let run_id = h.run().await;
    let raw = bundle(run_id, acme());

    h.pipeline.accept(h.tenant_id, run_id, &raw, false).await.unwrap();
    h.drain().await;
    let before = h.store.row_counts().await;

    let again = h.pipeline.accept(h.tenant_id, run_id, &raw, false).await.unwrap();
    assert!(again.already_accepted);
    assert_eq!(again.message, "Bundle already accepted");
    assert_eq!(again.status, RunStatus::Submitted);
    assert_eq!(h.store.row_counts().await, before);
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn accept_only_waits_for_approval() {
    let h = Harness::new();
    let run_id = h.run().await;

    let accepted = h.pipeline.accept(h.tenant_id, run_id, &bundle(run_id, acme()), true).await.unwrap();
    assert_eq!(accepted.status, RunStatus::NeedsReview);
    assert_eq!(accepted.job_id, None);
    assert!(h.drain().await.is_empty());

    let approved = h.pipeline.approve(h.tenant_id, run_id).await.unwrap();
    assert_eq!(approved.status, RunStatus::Ingesting);
    assert!(approved.message.contains(&approved.job_id.to_string()));

    let err = h.pipeline.approve(h.tenant_id, run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotReviewable(ref msg) if msg == "run_status_not_reviewable: ingesting"));

    h.drain().await;
    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(
        tx.get_run(h.tenant_id, run_id).await.unwrap().unwrap().status,
        RunStatus::Submitted
    );
}

#[tokio::test]
async fn company_without_known_source_is_rejected_before_any_write() {
    let h = Harness::new();
    let run_id = h.run().await;
    let before = h.store.row_counts().await;

    let mut company = acme();
    company["source_sha256s"] = json!(["f".repeat(64)]);
    company["evidence_snippets"] = json!([]);
    let err = h
        .pipeline
        .accept(h.tenant_id, run_id, &bundle(run_id, company), false)
        .await
        .unwrap_err();

    let PipelineError::Validation(report) = err else {
        panic!("expected a validation error");
    };
    let locs: Vec<_> = report.errors.iter().map(|e| e.loc.as_str()).collect();
    assert!(locs.contains(&"proposal_json.companies[0].evidence_snippets"));
    assert!(locs.contains(&"proposal_json.companies[0].source_sha256s[0]"));
    assert_eq!(h.store.row_counts().await, before);
}

#[tokio::test]
async fn bundle_for_another_run_is_rejected() {
    let h = Harness::new();
    let run_id = h.run().await;
    let err = h
        .pipeline
        .accept(h.tenant_id, run_id, &bundle(Uuid::new_v4(), acme()), false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(ref r) if r.errors[0].loc == "run_id"));

    let missing = Uuid::new_v4();
    let err = h
        .pipeline
        .accept(h.tenant_id, missing, &bundle(missing, acme()), false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RunNotFound(id) if id == missing));
}

#[tokio::test]
async fn job_time_failure_marks_the_run_failed() {
    let h = Harness::new();
    let run_id = h.run().await;
    let bundle_sha256 = "e".repeat(64);

    // Run points at a bundle that was never stored.
    let mut tx = h.store.begin().await.unwrap();
    let mut run = tx.get_run(h.tenant_id, run_id).await.unwrap().unwrap();
    run.status = RunStatus::Ingesting;
    run.bundle_sha256 = Some(bundle_sha256.clone());
    tx.update_run(&run).await.unwrap();
    tx.commit().await.unwrap();
    let job_id = h
        .pipeline
        .queue()
        .enqueue(h.tenant_id, run_id, JOB_INGEST_RUN, json!({ "bundle_sha256": bundle_sha256 }))
        .await
        .unwrap();

    let dispositions = h.drain().await;
    assert_eq!(
        dispositions,
        vec![JobDisposition::Dead {
            error: "stored_bundle_not_found".to_string()
        }]
    );

    let mut tx = h.store.begin().await.unwrap();
    let run = tx.get_run(h.tenant_id, run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some("stored_bundle_not_found"));
    assert_eq!(tx.get_job(job_id).await.unwrap().unwrap().status, JobStatus::Failed);
    let events = tx.list_events(h.tenant_id, run_id).await.unwrap();
    let failed = events
        .iter()
        .find(|e| e.event_type == "bundle_ingest_failed")
        .expect("failure event");
    assert_eq!(failed.status, EventStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("stored_bundle_not_found"));
}
