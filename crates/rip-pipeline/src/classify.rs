//! Quality classification and duplicate grouping over a run's sources.

use rip_core::{sha256_hex, SourceDocument, SourceOrigin, SourceStatus};
use rip_extract::{classify, group_duplicates, is_current, ClassifierConfig, DuplicateCandidate, Extraction};
use rip_store::StoreTx;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::PipelineResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationSummary {
    pub classified: usize,
    pub already_extracted: usize,
    pub duplicates_flagged: usize,
}

/// Stores an extraction verdict on the document. Returns `None` when the
/// existing verdict already covers these bytes.
pub fn apply_extraction(
    source: &mut SourceDocument,
    bytes: &[u8],
    mime_type: &str,
    config: &ClassifierConfig,
) -> Option<Extraction> {
    if is_current(source.meta.extraction.as_ref(), &sha256_hex(bytes)) {
        return None;
    }
    let extraction = classify(bytes, mime_type, config);
    if source.title.is_none() {
        source.title = extraction.meta.title.clone();
    }
    source.meta.extraction = Some(extraction.meta.clone());
    source.meta.quality_flags = Some(extraction.flags.clone());
    Some(extraction)
}

/// Classifies bundle sources that lack a current verdict, then regroups
/// duplicate templates across every classified source of the run.
pub async fn classify_run_sources(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    run_id: Uuid,
    config: &ClassifierConfig,
) -> PipelineResult<ClassificationSummary> {
    let mut summary = ClassificationSummary::default();
    let mut sources = tx.list_sources(tenant_id, run_id).await?;

    for source in sources.iter_mut() {
        if source.origin != SourceOrigin::Bundle || source.status != SourceStatus::Fetched {
            continue;
        }
        let Some(text) = source.content_text.clone() else {
            continue;
        };
        let mime = source.mime_type.clone().unwrap_or_else(|| "text/plain".to_string());
        match apply_extraction(source, text.as_bytes(), &mime, config) {
            Some(extraction) => {
                debug!(source_id = %source.id, decision = extraction.meta.decision.as_str(), "bundle source classified");
                tx.update_source(source).await?;
                summary.classified += 1;
            }
            None => summary.already_extracted += 1,
        }
    }

    let mut candidates: Vec<DuplicateCandidate> = sources
        .iter()
        .filter_map(|source| {
            let meta = source.meta.extraction.clone()?;
            Some(DuplicateCandidate {
                source_id: source.id,
                created_at: source.created_at,
                meta,
                flags: source.meta.quality_flags.clone().unwrap_or_default(),
            })
        })
        .collect();
    summary.duplicates_flagged = group_duplicates(&mut candidates);

    for candidate in candidates {
        let Some(source) = sources.iter_mut().find(|s| s.id == candidate.source_id) else {
            continue;
        };
        let changed = source.meta.extraction.as_ref() != Some(&candidate.meta)
            || source.meta.quality_flags.as_ref() != Some(&candidate.flags);
        if changed {
            source.meta.extraction = Some(candidate.meta);
            source.meta.quality_flags = Some(candidate.flags);
            tx.update_source(source).await?;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rip_core::{ReasonCode, SourceMeta, Validators};
    use rip_store::{MemoryStore, ResearchStore};

    fn bundle_doc(tenant_id: Uuid, run_id: Uuid, text: &str, offset_secs: i64) -> SourceDocument {
        let created = Utc::now() + Duration::seconds(offset_secs);
        SourceDocument {
            id: Uuid::new_v4(),
            tenant_id,
            run_id,
            origin: SourceOrigin::Bundle,
            url: None,
            url_normalized: None,
            title: None,
            mime_type: Some("text/plain".to_string()),
            status: SourceStatus::Fetched,
            failure_kind: None,
            attempt_count: 0,
            next_retry_at: None,
            http_status_code: None,
            content_hash: Some(sha256_hex(format!("{text}{offset_secs}").as_bytes())),
            content_text: Some(text.to_string()),
            fetched_at: Some(created),
            last_error: None,
            validators: Validators::default(),
            meta: SourceMeta::default(),
            created_at: created,
            updated_at: created,
        }
    }

    #[tokio::test]
    async fn later_copy_of_a_template_is_flagged_and_reclassification_is_skipped() {
        let store = MemoryStore::new();
        let (tenant_id, run_id) = (Uuid::new_v4(), Uuid::new_v4());
        let body = "Quarterly shipping volumes grew across every port in the region this year.";
        let first = bundle_doc(tenant_id, run_id, body, 0);
        let second = bundle_doc(tenant_id, run_id, body, 5);

        let mut tx = store.begin().await.unwrap();
        tx.insert_source(&second).await.unwrap();
        tx.insert_source(&first).await.unwrap();
        let summary = classify_run_sources(tx.as_mut(), tenant_id, run_id, &ClassifierConfig::default())
            .await
            .unwrap();
        assert_eq!(summary.classified, 2);
        assert_eq!(summary.duplicates_flagged, 1);

        let primary = tx.get_source(first.id).await.unwrap().unwrap();
        let copy = tx.get_source(second.id).await.unwrap().unwrap();
        let copy_flags = copy.meta.quality_flags.unwrap();
        assert!(copy_flags.is_duplicate_template);
        assert_eq!(copy_flags.duplicate_primary_source_id, Some(first.id));
        assert!(copy
            .meta
            .extraction
            .unwrap()
            .reason_codes
            .contains(&ReasonCode::FlagDuplicateTemplate));
        assert!(!primary.meta.quality_flags.unwrap().is_duplicate_template);

        let again = classify_run_sources(tx.as_mut(), tenant_id, run_id, &ClassifierConfig::default())
            .await
            .unwrap();
        assert_eq!(again.classified, 0);
        assert_eq!(again.already_extracted, 2);
        assert_eq!(again.duplicates_flagged, 0);
    }
}
