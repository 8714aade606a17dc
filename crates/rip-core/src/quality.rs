//! Extraction verdict types stored on source documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EXTRACTION_VERSION: &str = "extract_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Flag,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Flag => "flag",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    RejectEmptyText,
    RejectExtremeThin,
    FlagThinContent,
    FlagPaywallOrLogin,
    FlagErrorPage,
    FlagBoilerplateDominant,
    FlagUnsupportedType,
    FlagUnextractablePdf,
    FlagPdfBytesMissing,
    FlagDuplicateTemplate,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RejectEmptyText => "REJECT_EMPTY_TEXT",
            Self::RejectExtremeThin => "REJECT_EXTREME_THIN",
            Self::FlagThinContent => "FLAG_THIN_CONTENT",
            Self::FlagPaywallOrLogin => "FLAG_PAYWALL_OR_LOGIN",
            Self::FlagErrorPage => "FLAG_ERROR_PAGE",
            Self::FlagBoilerplateDominant => "FLAG_BOILERPLATE_DOMINANT",
            Self::FlagUnsupportedType => "FLAG_UNSUPPORTED_TYPE",
            Self::FlagUnextractablePdf => "FLAG_UNEXTRACTABLE_PDF",
            Self::FlagPdfBytesMissing => "FLAG_PDF_BYTES_MISSING",
            Self::FlagDuplicateTemplate => "FLAG_DUPLICATE_TEMPLATE",
        }
    }

    pub fn is_reject(self) -> bool {
        matches!(self, Self::RejectEmptyText | Self::RejectExtremeThin)
    }
}

/// Any reject code wins, then any flag, otherwise accept.
pub fn decide(codes: &[ReasonCode]) -> Decision {
    if codes.iter().any(|c| c.is_reject()) {
        Decision::Reject
    } else if codes.is_empty() {
        Decision::Accept
    } else {
        Decision::Flag
    }
}

/// Sorts by wire name and removes repeats.
pub fn sort_reason_codes(codes: &mut Vec<ReasonCode>) {
    codes.sort_by_key(|c| c.as_str());
    codes.dedup();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFlags {
    pub is_thin: bool,
    pub is_paywall_or_login: bool,
    pub is_error_page: bool,
    pub is_duplicate_template: bool,
    pub is_unextractable_pdf: bool,
    pub is_pdf_bytes_missing: bool,
    pub is_unsupported_type: bool,
    pub is_boilerplate_dominant: bool,
    pub duplicate_group_key: Option<String>,
    pub duplicate_primary_source_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMeta {
    pub version: String,
    pub decision: Decision,
    pub reason_codes: Vec<ReasonCode>,
    pub title: Option<String>,
    pub word_count: usize,
    pub char_count: usize,
    pub line_count: usize,
    pub unique_token_ratio: f64,
    pub alpha_ratio: f64,
    pub text_hash: String,
    pub source_material_hash: String,
    pub signature_prefix_2k: String,
    pub signature_tokens: String,
    pub extracted_at: DateTime<Utc>,
}
