//! Text extraction and quality classification for fetched sources.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rip_core::quality::{decide, sort_reason_codes, EXTRACTION_VERSION};
use rip_core::{sha256_hex, ExtractionMeta, QualityFlags, ReasonCode};
use serde::Deserialize;
use uuid::Uuid;

pub mod html;

pub use html::{extract_html, HtmlText};

pub const CRATE_NAME: &str = "rip-extract";

/// Thresholds and keyword lists. Every field can be overridden from YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_words_html: usize,
    pub min_words_pdf: usize,
    pub extreme_min_words: usize,
    pub signature_prefix_chars: usize,
    pub signature_token_count: usize,
    pub scan_chars: usize,
    pub unique_token_ratio_min: f64,
    pub alpha_ratio_min: f64,
    pub paywall_keywords: Vec<String>,
    pub error_keywords: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_words_html: 150,
            min_words_pdf: 50,
            extreme_min_words: 5,
            signature_prefix_chars: 2000,
            signature_token_count: 500,
            scan_chars: 2000,
            unique_token_ratio_min: 0.12,
            alpha_ratio_min: 0.55,
            paywall_keywords: ["subscribe", "sign in", "log in", "access denied", "registration", "paywall"]
                .into_iter()
                .map(String::from)
                .collect(),
            error_keywords: ["page not found", "404", "service unavailable", "temporarily unavailable"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ClassifierConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading classifier config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing classifier config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub meta: ExtractionMeta,
    pub flags: QualityFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Material {
    Html,
    Pdf,
    Text,
    Unsupported,
}

fn material_for(mime: &str) -> Material {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "text/html" | "application/xhtml+xml" => Material::Html,
        "application/pdf" => Material::Pdf,
        "text/plain" | "" => Material::Text,
        _ => Material::Unsupported,
    }
}

/// CRLF and CR become LF, runs of spaces and tabs collapse, blank lines go.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = Vec::new();
    for line in unified.split('\n') {
        let mut collapsed = String::with_capacity(line.len());
        let mut in_gap = false;
        for c in line.chars() {
            if c == ' ' || c == '\t' {
                if !in_gap {
                    collapsed.push(' ');
                }
                in_gap = true;
            } else {
                collapsed.push(c);
                in_gap = false;
            }
        }
        if !collapsed.trim().is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n").trim().to_string()
}

/// Lowercase word tokens: maximal runs of alphanumerics and underscores.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn extract_pdf(bytes: &[u8]) -> Option<String> {
    // pdf-extract panics on some malformed documents.
    std::panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .ok()
        .and_then(Result::ok)
}

pub fn classify(bytes: &[u8], mime_type: &str, config: &ClassifierConfig) -> Extraction {
    classify_at(bytes, mime_type, config, Utc::now())
}

pub fn classify_at(
    bytes: &[u8],
    mime_type: &str,
    config: &ClassifierConfig,
    extracted_at: DateTime<Utc>,
) -> Extraction {
    let material = material_for(mime_type);
    let mut codes = Vec::new();
    let mut flags = QualityFlags::default();
    let mut has_login_form = false;

    let (raw_text, title) = match material {
        Material::Html => {
            let page = extract_html(bytes);
            has_login_form = page.has_login_form;
            (page.text, page.title)
        }
        Material::Pdf if bytes.is_empty() => {
            flags.is_pdf_bytes_missing = true;
            codes.push(ReasonCode::FlagPdfBytesMissing);
            (String::new(), None)
        }
        Material::Pdf => match extract_pdf(bytes) {
            Some(text) => (text, None),
            None => {
                flags.is_unextractable_pdf = true;
                codes.push(ReasonCode::FlagUnextractablePdf);
                (String::new(), None)
            }
        },
        Material::Text => (String::from_utf8_lossy(bytes).into_owned(), None),
        Material::Unsupported => {
            flags.is_unsupported_type = true;
            codes.push(ReasonCode::FlagUnsupportedType);
            (String::from_utf8_lossy(bytes).into_owned(), None)
        }
    };

    let text = normalize_text(&raw_text);
    let tokens = tokenize(&text);
    let word_count = tokens.len();
    let char_count = text.chars().count();
    let line_count = text.lines().filter(|l| !l.trim().is_empty()).count();
    let unique_tokens = tokens.iter().collect::<HashSet<_>>().len();
    let unique_token_ratio = unique_tokens as f64 / word_count.max(1) as f64;
    let alpha_ratio = text.chars().filter(|c| c.is_alphabetic()).count() as f64 / char_count.max(1) as f64;

    if word_count == 0 {
        codes.push(ReasonCode::RejectEmptyText);
    } else {
        let min_words = if material == Material::Pdf {
            config.min_words_pdf
        } else {
            config.min_words_html
        };
        if word_count < config.extreme_min_words {
            flags.is_thin = true;
            codes.push(ReasonCode::RejectExtremeThin);
        } else if word_count < min_words {
            flags.is_thin = true;
            codes.push(ReasonCode::FlagThinContent);
        }

        let head = format!(
            "{} {}",
            title.as_deref().unwrap_or_default(),
            text.chars().take(config.scan_chars).collect::<String>()
        )
        .to_lowercase();
        if has_login_form || config.paywall_keywords.iter().any(|k| head.contains(&k.to_lowercase())) {
            flags.is_paywall_or_login = true;
            codes.push(ReasonCode::FlagPaywallOrLogin);
        }
        if config.error_keywords.iter().any(|k| head.contains(&k.to_lowercase())) {
            flags.is_error_page = true;
            codes.push(ReasonCode::FlagErrorPage);
        }

        let boilerplate = (unique_token_ratio < config.unique_token_ratio_min
            || alpha_ratio < config.alpha_ratio_min)
            && word_count >= config.min_words_html;
        if boilerplate {
            flags.is_boilerplate_dominant = true;
            codes.push(ReasonCode::FlagBoilerplateDominant);
        }
    }

    sort_reason_codes(&mut codes);
    let prefix: String = text.chars().take(config.signature_prefix_chars).collect();
    let token_prefix = tokens
        .iter()
        .take(config.signature_token_count)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");

    let meta = ExtractionMeta {
        version: EXTRACTION_VERSION.to_string(),
        decision: decide(&codes),
        reason_codes: codes,
        title,
        word_count,
        char_count,
        line_count,
        unique_token_ratio,
        alpha_ratio,
        text_hash: sha256_hex(text.as_bytes()),
        source_material_hash: sha256_hex(bytes),
        signature_prefix_2k: sha256_hex(prefix.as_bytes()),
        signature_tokens: sha256_hex(token_prefix.as_bytes()),
        extracted_at,
    };

    Extraction { text, meta, flags }
}

/// A previous extraction is reusable when both the extractor version and the
/// source bytes are unchanged.
pub fn is_current(meta: Option<&ExtractionMeta>, material_hash: &str) -> bool {
    meta.is_some_and(|m| m.version == EXTRACTION_VERSION && m.source_material_hash == material_hash)
}

/// One classified document of a run, as seen by duplicate grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCandidate {
    pub source_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub meta: ExtractionMeta,
    pub flags: QualityFlags,
}

/// Groups candidates sharing `signature_prefix_2k`. The earliest document
/// (`created_at`, then id) stays primary; the rest are flagged
/// `FLAG_DUPLICATE_TEMPLATE` and their decision recomputed. Returns the
/// number of documents demoted.
pub fn group_duplicates(candidates: &mut [DuplicateCandidate]) -> usize {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        if candidate.meta.word_count == 0 {
            continue;
        }
        groups
            .entry(candidate.meta.signature_prefix_2k.clone())
            .or_default()
            .push(idx);
    }

    let mut demoted = 0;
    for (signature, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|a, b| {
            let (a, b) = (&candidates[*a], &candidates[*b]);
            (a.created_at, a.source_id).cmp(&(b.created_at, b.source_id))
        });
        let primary_id = candidates[members[0]].source_id;
        let group_key = signature.chars().take(16).collect::<String>();

        for (rank, idx) in members.into_iter().enumerate() {
            let candidate = &mut candidates[idx];
            candidate.flags.duplicate_group_key = Some(group_key.clone());
            candidate.flags.duplicate_primary_source_id = Some(primary_id);
            if rank == 0 {
                continue;
            }
            candidate.flags.is_duplicate_template = true;
            if !candidate.meta.reason_codes.contains(&ReasonCode::FlagDuplicateTemplate) {
                candidate.meta.reason_codes.push(ReasonCode::FlagDuplicateTemplate);
                sort_reason_codes(&mut candidate.meta.reason_codes);
                demoted += 1;
            }
            candidate.meta.decision = decide(&candidate.meta.reason_codes);
        }
    }
    demoted
}
