//! Canonical company resolution.
//!
//! Prospects of a run pick the groups: website domain first, then
//! normalized name plus country. Every prospect of the tenant that shares a
//! group key is linked along with them, so earlier runs join the same
//! [`CanonicalCompany`]. A prospect is linked only when at least one of its
//! evidence rows points at a source document.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use rip_core::normalize::{name_country_key, normalize_domain};
use rip_core::{
    CanonicalCompany, CanonicalCompanyDomain, CanonicalCompanyLink, CompanyProspect, EventStatus, MatchRule,
};
use rip_store::StoreTx;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{record_event, Pipeline, PipelineError, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveSummary {
    pub companies_scanned: usize,
    pub created: usize,
    pub matched: usize,
    pub links_created: usize,
    pub links_existing: usize,
    pub conflicts_skipped: usize,
    pub evidence_missing_skipped: usize,
    pub warnings_multi_evidence: usize,
    pub unresolvable_skipped: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Domain(String),
    NameCountry(String, String),
}

impl GroupKey {
    fn rule(&self) -> MatchRule {
        match self {
            Self::Domain(_) => MatchRule::Domain,
            Self::NameCountry(..) => MatchRule::NameCountry,
        }
    }
}

fn group_key(prospect: &CompanyProspect) -> Option<GroupKey> {
    if let Some(domain) = prospect.website_url.as_deref().and_then(normalize_domain) {
        return Some(GroupKey::Domain(domain));
    }
    let country = prospect.hq_country.as_deref().map(str::trim).unwrap_or_default();
    if prospect.name_normalized.is_empty() || country.is_empty() {
        return None;
    }
    let (name, country) = name_country_key(&prospect.name_normalized, country);
    Some(GroupKey::NameCountry(name, country))
}

impl Pipeline {
    /// Resolves the run's prospects into canonical companies in one transaction.
    pub async fn resolve(&self, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<ResolveSummary> {
        let mut tx = self.store.begin().await?;
        if tx.get_run(tenant_id, run_id).await?.is_none() {
            return Err(PipelineError::RunNotFound(run_id));
        }
        let summary = resolve_run(tx.as_mut(), tenant_id, run_id).await?;
        record_event(
            tx.as_mut(),
            tenant_id,
            run_id,
            "canonical_resolved",
            if summary.warnings.is_empty() { EventStatus::Ok } else { EventStatus::Warn },
            json!({}),
            serde_json::to_value(&summary).map_err(anyhow::Error::from)?,
        )
        .await?;
        tx.commit().await?;

        info!(
            %run_id,
            scanned = summary.companies_scanned,
            created = summary.created,
            matched = summary.matched,
            links_created = summary.links_created,
            links_existing = summary.links_existing,
            conflicts = summary.conflicts_skipped,
            "canonical companies resolved"
        );
        Ok(summary)
    }
}

/// Resolution body, run inside the caller's transaction.
pub async fn resolve_run(tx: &mut dyn StoreTx, tenant_id: Uuid, run_id: Uuid) -> PipelineResult<ResolveSummary> {
    let mut summary = ResolveSummary::default();
    let drivers = tx.list_prospects(tenant_id, run_id).await?;
    summary.companies_scanned = drivers.len();

    // First-seen order over (created_at, id); domain groups go first.
    let mut order: Vec<GroupKey> = Vec::new();
    let mut wanted: HashSet<GroupKey> = HashSet::new();
    for prospect in &drivers {
        match group_key(prospect) {
            Some(key) => {
                if wanted.insert(key.clone()) {
                    order.push(key);
                }
            }
            None => summary.unresolvable_skipped += 1,
        }
    }
    order.sort_by_key(|key| matches!(key, GroupKey::NameCountry(..)));

    let mut groups: HashMap<GroupKey, Vec<CompanyProspect>> = HashMap::new();
    for prospect in tx.list_tenant_prospects(tenant_id).await? {
        if let Some(key) = group_key(&prospect).filter(|key| wanted.contains(key)) {
            groups.entry(key).or_default().push(prospect);
        }
    }

    for key in order {
        let members = groups.remove(&key).unwrap_or_default();
        let Some(first) = members.first() else {
            continue;
        };
        let canonical = find_or_create_canonical(tx, tenant_id, &key, first, &mut summary).await?;
        for prospect in &members {
            link_prospect(tx, &canonical, prospect, key.rule(), &mut summary).await?;
        }
    }

    Ok(summary)
}

async fn find_or_create_canonical(
    tx: &mut dyn StoreTx,
    tenant_id: Uuid,
    key: &GroupKey,
    first: &CompanyProspect,
    summary: &mut ResolveSummary,
) -> PipelineResult<CanonicalCompany> {
    let existing = match key {
        GroupKey::Domain(domain) => tx.find_canonical_by_domain(tenant_id, domain).await?,
        GroupKey::NameCountry(name, country) => tx.find_canonical_by_name_country(tenant_id, name, country).await?,
    };
    if let Some(canonical) = existing {
        summary.matched += 1;
        return Ok(canonical);
    }

    let now = Utc::now();
    let (name_normalized, primary_domain, country_code) = match key {
        GroupKey::Domain(domain) => (
            first.name_normalized.clone(),
            Some(domain.clone()),
            first.hq_country.as_deref().map(|c| c.trim().to_ascii_uppercase()),
        ),
        GroupKey::NameCountry(name, country) => (name.clone(), None, Some(country.clone())),
    };
    let canonical = CanonicalCompany {
        id: Uuid::new_v4(),
        tenant_id,
        canonical_name: first.name_raw.clone(),
        name_normalized,
        primary_domain,
        country_code,
        created_at: now,
        updated_at: now,
    };
    tx.insert_canonical(&canonical).await?;
    if let Some(domain) = &canonical.primary_domain {
        tx.insert_canonical_domain(&CanonicalCompanyDomain {
            id: Uuid::new_v4(),
            tenant_id,
            canonical_company_id: canonical.id,
            domain: domain.clone(),
            created_at: now,
        })
        .await?;
    }
    summary.created += 1;
    Ok(canonical)
}

async fn link_prospect(
    tx: &mut dyn StoreTx,
    canonical: &CanonicalCompany,
    prospect: &CompanyProspect,
    rule: MatchRule,
    summary: &mut ResolveSummary,
) -> PipelineResult<()> {
    let documents: BTreeSet<String> = tx
        .list_evidence(prospect.id)
        .await?
        .into_iter()
        .filter_map(|e| e.source_document_id)
        .map(|id| id.to_string())
        .collect();

    let Some(chosen) = documents.iter().next() else {
        summary.evidence_missing_skipped += 1;
        summary.conflicts_skipped += 1;
        warn!(prospect_id = %prospect.id, "prospect has no evidence document, not linked");
        return Ok(());
    };
    let evidence_source_document_id = Uuid::parse_str(chosen).map_err(anyhow::Error::from)?;
    if documents.len() > 1 {
        summary.warnings_multi_evidence += 1;
        summary.conflicts_skipped += 1;
        summary.warnings.push(format!(
            "multi_evidence:{}:{} documents, chose {}",
            prospect.id,
            documents.len(),
            chosen
        ));
    }

    let now = Utc::now();
    let link = CanonicalCompanyLink {
        id: Uuid::new_v4(),
        tenant_id: prospect.tenant_id,
        canonical_company_id: canonical.id,
        company_entity_id: prospect.id,
        match_rule: rule,
        evidence_source_document_id,
        evidence_run_id: prospect.run_id,
        created_at: now,
        updated_at: now,
    };
    if tx.upsert_link(&link).await? {
        summary.links_created += 1;
    } else {
        summary.links_existing += 1;
    }
    Ok(())
}
