//! `run_bundle_v1` upload format, the AI proposal it carries, and their
//! validation rules.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::{canonical_hash, sha256_hex, CanonicalError};
use crate::normalize::{is_http_url, normalize_company_name, normalize_metric_key};

pub const RUN_BUNDLE_VERSION: &str = "run_bundle_v1";
pub const MAX_QUERY_CHARS: usize = 2000;
pub const ALIAS_TYPES: &[&str] = &["legal", "trade", "former", "local", "abbreviation"];

fn default_bundle_version() -> String {
    RUN_BUNDLE_VERSION.to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBundle {
    #[serde(default = "default_bundle_version")]
    pub version: String,
    pub run_id: Uuid,
    #[serde(default = "empty_object")]
    pub plan_json: Value,
    #[serde(default)]
    pub steps: Vec<RunStep>,
    #[serde(default)]
    pub sources: Vec<BundleSource>,
    pub proposal_json: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Search,
    Fetch,
    Extract,
    Validate,
    Compose,
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Ok,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub step_key: String,
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(default = "empty_object")]
    pub inputs_json: Value,
    #[serde(default = "empty_object")]
    pub outputs_json: Value,
    #[serde(default = "empty_object")]
    pub provider_meta: Value,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_sha256: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSource {
    pub sha256: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub content_text: String,
    #[serde(default = "empty_object")]
    pub meta: Value,
    #[serde(default)]
    pub temp_id: Option<String>,
}

impl RunBundle {
    /// Lowercases source hashes so lookups and the bundle hash are case-insensitive.
    pub fn normalized(mut self) -> Self {
        for source in &mut self.sources {
            source.sha256 = source.sha256.trim().to_ascii_lowercase();
        }
        self
    }

    pub fn content_hash(&self) -> Result<String, CanonicalError> {
        canonical_hash(self)
    }

    pub fn source_by_sha(&self, sha: &str) -> Option<&BundleSource> {
        let sha = sha.trim().to_ascii_lowercase();
        self.sources.iter().find(|s| s.sha256 == sha)
    }

    pub fn parse_proposal(&self) -> Result<Proposal, serde_json::Error> {
        serde_json::from_value(self.proposal_json.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub query: String,
    #[serde(default)]
    pub sources: Vec<ProposalSource>,
    pub companies: Vec<ProposalCompany>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Legacy temp-id reference to a source cited by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalSource {
    pub temp_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalCompany {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<ProposalAlias>,
    #[serde(default)]
    pub metrics: Vec<ProposalMetric>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub hq_country: Option<String>,
    #[serde(default)]
    pub hq_city: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ai_rank: Option<i32>,
    #[serde(default)]
    pub ai_score: Option<f64>,
    #[serde(default)]
    pub evidence_snippets: Vec<String>,
    #[serde(default)]
    pub source_sha256s: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalAlias {
    pub name: String,
    #[serde(rename = "type")]
    pub alias_type: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Number,
    Text,
    Bool,
    Json,
}

/// Metric payload with an explicit discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Bool(bool),
    Json(Value),
}

impl MetricValue {
    /// Checks the raw payload against the declared type.
    pub fn from_typed(metric_type: MetricType, value: &Value) -> Result<Self, String> {
        match (metric_type, value) {
            (_, Value::Null) => Err("value is required".to_string()),
            (MetricType::Number, Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(MetricValue::Number)
                .ok_or_else(|| "value is not a finite number".to_string()),
            (MetricType::Text, Value::String(s)) => Ok(MetricValue::Text(s.clone())),
            (MetricType::Bool, Value::Bool(b)) => Ok(MetricValue::Bool(*b)),
            (MetricType::Json, v @ (Value::Object(_) | Value::Array(_))) => {
                Ok(MetricValue::Json(v.clone()))
            }
            (t, _) => Err(format!("value does not match declared type {}", t.as_str())),
        }
    }

    pub fn metric_type(&self) -> MetricType {
        match self {
            Self::Number(_) => MetricType::Number,
            Self::Text(_) => MetricType::Text,
            Self::Bool(_) => MetricType::Bool,
            Self::Json(_) => MetricType::Json,
        }
    }
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMetric {
    pub key: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: Value,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub as_of_date: Option<NaiveDate>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub source_temp_id: Option<String>,
    #[serde(default)]
    pub evidence_snippet: Option<String>,
}

impl ProposalMetric {
    pub fn typed_value(&self) -> Result<MetricValue, String> {
        MetricValue::from_typed(self.metric_type, &self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub loc: String,
    pub msg: String,
}

impl ValidationIssue {
    pub fn new(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, loc: impl Into<String>, msg: impl Into<String>) {
        self.errors.push(ValidationIssue::new(loc, msg));
    }
}

/// Parses an uploaded body. Shape errors are reported against `body`.
pub fn parse_bundle(raw: &Value) -> Result<RunBundle, ValidationReport> {
    serde_json::from_value::<RunBundle>(raw.clone())
        .map(RunBundle::normalized)
        .map_err(|err| ValidationReport {
            errors: vec![ValidationIssue::new("body", err.to_string())],
            warnings: Vec::new(),
        })
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn in_unit_interval(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

/// Full bundle validation. Pure: never touches storage.
pub fn validate_bundle(bundle: &RunBundle, expected_run_id: Option<Uuid>) -> ValidationReport {
    let mut report = ValidationReport::default();

    if bundle.version != RUN_BUNDLE_VERSION {
        report.error("version", format!("unsupported bundle version {}", bundle.version));
    }
    if let Some(expected) = expected_run_id {
        if bundle.run_id != expected {
            report.error("run_id", "run_id does not match the target run");
        }
    }
    if !bundle.plan_json.is_object() {
        report.error("plan_json", "plan_json must be an object");
    }

    let mut step_keys = HashSet::new();
    for (i, step) in bundle.steps.iter().enumerate() {
        if step.step_key.trim().is_empty() {
            report.error(format!("steps[{i}].step_key"), "step_key must not be empty");
        } else if !step_keys.insert(step.step_key.as_str()) {
            report.error(format!("steps[{i}].step_key"), "duplicate step_key");
        }
    }

    let mut seen_hashes = HashSet::new();
    let mut temp_ids = HashSet::new();
    for (i, source) in bundle.sources.iter().enumerate() {
        let loc = format!("sources[{i}]");
        if !is_sha256_hex(&source.sha256) {
            report.error(format!("{loc}.sha256"), "sha256 must be 64 hex characters");
        } else if !seen_hashes.insert(source.sha256.as_str()) {
            report.error(format!("{loc}.sha256"), "duplicate source sha256");
        }
        if source.content_text.trim().is_empty() {
            report.error(format!("{loc}.content_text"), "content_text must not be empty");
        } else if sha256_hex(source.content_text.as_bytes()) != source.sha256 {
            report.error(format!("{loc}.sha256"), "sha256 does not match content_text");
        }
        if let Some(temp_id) = &source.temp_id {
            if !temp_ids.insert(temp_id.as_str()) {
                report.error(format!("{loc}.temp_id"), "duplicate temp_id");
            }
        }
        if let Some(url) = &source.url {
            if !is_http_url(url) {
                report.error(format!("{loc}.url"), "url must be http or https");
            }
        }
    }

    match bundle.parse_proposal() {
        Ok(proposal) => {
            let known_hashes: HashSet<&str> =
                bundle.sources.iter().map(|s| s.sha256.as_str()).collect();
            let bundle_temp_ids: HashSet<&str> = bundle
                .sources
                .iter()
                .filter_map(|s| s.temp_id.as_deref())
                .collect();
            let proposal_report = validate_proposal(&proposal, &known_hashes, &bundle_temp_ids);
            for issue in proposal_report.errors {
                report.error(format!("proposal_json.{}", issue.loc), issue.msg);
            }
            report.warnings.extend(proposal_report.warnings);
        }
        Err(err) => report.error("proposal_json", err.to_string()),
    }

    report
}

/// Proposal schema and evidence rules. `known_hashes` must be lowercase.
pub fn validate_proposal(
    proposal: &Proposal,
    known_hashes: &HashSet<&str>,
    extra_temp_ids: &HashSet<&str>,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let query_len = proposal.query.trim().chars().count();
    if query_len == 0 || query_len > MAX_QUERY_CHARS {
        report.error("query", format!("query must be 1..={MAX_QUERY_CHARS} characters"));
    }

    let mut temp_ids: HashSet<&str> = extra_temp_ids.clone();
    let mut proposal_temp_ids = HashSet::new();
    for (i, source) in proposal.sources.iter().enumerate() {
        if !proposal_temp_ids.insert(source.temp_id.as_str()) {
            report.error(format!("sources[{i}].temp_id"), "duplicate temp_id");
        }
        if !is_http_url(&source.url) {
            report.error(format!("sources[{i}].url"), "url must be http or https");
        }
        temp_ids.insert(source.temp_id.as_str());
    }

    if proposal.companies.is_empty() {
        report.error("companies", "at least one company is required");
    }

    let mut seen_names: HashMap<String, usize> = HashMap::new();
    for (i, company) in proposal.companies.iter().enumerate() {
        let loc = format!("companies[{i}]");
        let normalized = normalize_company_name(&company.name);
        if normalized.is_empty() {
            report.error(format!("{loc}.name"), "name must not be empty");
        } else if let Some(first) = seen_names.insert(normalized.clone(), i) {
            report.warnings.push(format!(
                "companies[{i}] duplicates companies[{first}] ({normalized}); facts will be merged"
            ));
        }

        if company.evidence_snippets.is_empty() {
            report.error(
                format!("{loc}.evidence_snippets"),
                "at least one evidence snippet is required",
            );
        }
        for (j, snippet) in company.evidence_snippets.iter().enumerate() {
            if snippet.trim().is_empty() {
                report.error(
                    format!("{loc}.evidence_snippets[{j}]"),
                    "evidence snippet must not be empty",
                );
            }
        }
        if company.source_sha256s.is_empty() {
            report.error(
                format!("{loc}.source_sha256s"),
                "at least one source sha256 is required",
            );
        }
        for (j, sha) in company.source_sha256s.iter().enumerate() {
            let sha = sha.trim().to_ascii_lowercase();
            if !known_hashes.contains(sha.as_str()) {
                report.error(
                    format!("{loc}.source_sha256s[{j}]"),
                    format!("unknown source sha256 {sha}"),
                );
            }
        }

        if let Some(url) = company.website_url.as_deref().filter(|u| !u.trim().is_empty()) {
            if !is_http_url(url) {
                report.error(format!("{loc}.website_url"), "website_url must be http or https");
            }
        }
        if let Some(country) = company.hq_country.as_deref().filter(|c| !c.trim().is_empty()) {
            let country = country.trim();
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                report.error(format!("{loc}.hq_country"), "hq_country must be a 2-letter uppercase code");
            }
        }
        if let Some(rank) = company.ai_rank {
            if rank < 1 {
                report.error(format!("{loc}.ai_rank"), "ai_rank must be >= 1");
            }
        }
        if let Some(score) = company.ai_score {
            if !in_unit_interval(score) {
                report.error(format!("{loc}.ai_score"), "ai_score must be within [0, 1]");
            }
        }

        for (j, metric) in company.metrics.iter().enumerate() {
            let mloc = format!("{loc}.metrics[{j}]");
            if normalize_metric_key(&metric.key).is_empty() {
                report.error(format!("{mloc}.key"), "key must contain letters or digits");
            }
            if let Err(msg) = metric.typed_value() {
                report.error(format!("{mloc}.value"), msg);
            }
            if let Some(currency) = metric.currency.as_deref() {
                let currency = currency.trim();
                if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                    report.error(format!("{mloc}.currency"), "currency must be a 3-letter uppercase code");
                }
            }
            if let Some(confidence) = metric.confidence {
                if !in_unit_interval(confidence) {
                    report.error(format!("{mloc}.confidence"), "confidence must be within [0, 1]");
                }
            }
            if let Some(temp_id) = metric.source_temp_id.as_deref() {
                if !temp_ids.contains(temp_id) {
                    report.error(
                        format!("{mloc}.source_temp_id"),
                        format!("unknown source_temp_id {temp_id}"),
                    );
                }
            }
        }

        for (j, alias) in company.aliases.iter().enumerate() {
            let aloc = format!("{loc}.aliases[{j}]");
            if alias.name.trim().is_empty() {
                report.error(format!("{aloc}.name"), "alias name must not be empty");
            }
            let alias_type = alias.alias_type.trim().to_ascii_lowercase();
            if !ALIAS_TYPES.contains(&alias_type.as_str()) {
                report.error(
                    format!("{aloc}.type"),
                    format!("alias type must be one of {}", ALIAS_TYPES.join(", ")),
                );
            }
            if let Some(confidence) = alias.confidence {
                if !in_unit_interval(confidence) {
                    report.error(format!("{aloc}.confidence"), "confidence must be within [0, 1]");
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONTENT: &str = "Example content";

    fn bundle_json(run_id: Uuid) -> Value {
        json!({
            "version": "run_bundle_v1",
            "run_id": run_id,
            "plan_json": {"query": "acme"},
            "steps": [{"step_key": "search-1", "step_type": "search", "status": "ok"}],
            "sources": [{
                "sha256": sha256_hex(CONTENT.as_bytes()),
                "url": "https://acme.example/about",
                "content_text": CONTENT,
                "temp_id": "s1"
            }],
            "proposal_json": {
                "query": "acme",
                "companies": [{
                    "name": "Acme Ltd",
                    "evidence_snippets": ["evidence"],
                    "source_sha256s": [sha256_hex(CONTENT.as_bytes())],
                    "metrics": [{"key": "Revenue", "type": "number", "value": 12.5, "source_temp_id": "s1"}]
                }]
            }
        })
    }

    #[test]
    fn well_formed_bundle_validates() {
        let run_id = Uuid::new_v4();
        let bundle = parse_bundle(&bundle_json(run_id)).unwrap();
        let report = validate_bundle(&bundle, Some(run_id));
        assert!(report.ok(), "{:?}", report.errors);
    }

    #[test]
    fn hash_mismatch_is_reported_against_the_source() {
        let run_id = Uuid::new_v4();
        let mut raw = bundle_json(run_id);
        raw["sources"][0]["content_text"] = json!("tampered");
        let bundle = parse_bundle(&raw).unwrap();
        let report = validate_bundle(&bundle, Some(run_id));
        assert!(report
            .errors
            .iter()
            .any(|e| e.loc == "sources[0].sha256" && e.msg.contains("does not match")));
    }

    #[test]
    fn missing_evidence_and_unknown_hash_reject_the_company() {
        let run_id = Uuid::new_v4();
        let mut raw = bundle_json(run_id);
        raw["proposal_json"]["companies"][0]["evidence_snippets"] = json!([]);
        raw["proposal_json"]["companies"][0]["source_sha256s"] = json!(["f".repeat(64)]);
        let report = validate_bundle(&parse_bundle(&raw).unwrap(), Some(run_id));
        let locs: Vec<_> = report.errors.iter().map(|e| e.loc.as_str()).collect();
        assert!(locs.contains(&"proposal_json.companies[0].evidence_snippets"));
        assert!(locs.contains(&"proposal_json.companies[0].source_sha256s[0]"));
    }

    #[test]
    fn run_id_must_match_target() {
        let raw = bundle_json(Uuid::new_v4());
        let report = validate_bundle(&parse_bundle(&raw).unwrap(), Some(Uuid::new_v4()));
        assert_eq!(report.errors[0].loc, "run_id");
    }

    #[test]
    fn metric_value_must_match_declared_type() {
        assert!(MetricValue::from_typed(MetricType::Number, &json!("12")).is_err());
        assert!(MetricValue::from_typed(MetricType::Json, &json!(3)).is_err());
        assert_eq!(
            MetricValue::from_typed(MetricType::Bool, &json!(true)).unwrap(),
            MetricValue::Bool(true)
        );
        assert_eq!(
            serde_json::to_value(MetricValue::Text("x".into())).unwrap(),
            json!({"type": "text", "value": "x"})
        );
    }

    #[test]
    fn uppercase_source_hashes_are_normalized() {
        let run_id = Uuid::new_v4();
        let mut raw = bundle_json(run_id);
        let upper = sha256_hex(CONTENT.as_bytes()).to_ascii_uppercase();
        raw["sources"][0]["sha256"] = json!(upper);
        let bundle = parse_bundle(&raw).unwrap();
        assert!(validate_bundle(&bundle, Some(run_id)).ok());
        assert_eq!(
            bundle.content_hash().unwrap(),
            parse_bundle(&bundle_json(run_id)).unwrap().content_hash().unwrap()
        );
    }

    #[test]
    fn duplicate_company_names_warn_without_failing() {
        let run_id = Uuid::new_v4();
        let mut raw = bundle_json(run_id);
        let company = raw["proposal_json"]["companies"][0].clone();
        let mut twin = company.clone();
        twin["name"] = json!("ACME Limited");
        raw["proposal_json"]["companies"] = json!([company, twin]);
        let report = validate_bundle(&parse_bundle(&raw).unwrap(), Some(run_id));
        assert!(report.ok());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn country_and_currency_codes_must_be_uppercase() {
        let run_id = Uuid::new_v4();
        let mut raw = bundle_json(run_id);
        raw["proposal_json"]["companies"][0]["hq_country"] = json!("om");
        raw["proposal_json"]["companies"][0]["metrics"][0]["currency"] = json!("usd");
        let report = validate_bundle(&parse_bundle(&raw).unwrap(), Some(run_id));
        let locs: Vec<_> = report.errors.iter().map(|e| e.loc.as_str()).collect();
        assert_eq!(
            locs,
            vec![
                "proposal_json.companies[0].hq_country",
                "proposal_json.companies[0].metrics[0].currency"
            ]
        );

        raw["proposal_json"]["companies"][0]["hq_country"] = json!("OM");
        raw["proposal_json"]["companies"][0]["metrics"][0]["currency"] = json!("USD");
        assert!(validate_bundle(&parse_bundle(&raw).unwrap(), Some(run_id)).ok());
    }
}
