//! Normalization helpers shared by ingestion, fetching and resolution.

use thiserror::Error;
use url::Url;

const LEGAL_SUFFIXES: &[&str] = &[
    "ltd",
    "llc",
    "plc",
    "saog",
    "sa",
    "gmbh",
    "ag",
    "inc",
    "corp",
    "corporation",
    "limited",
    "group",
    "holdings",
    "company",
    "co",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("empty_url")]
    Empty,
    #[error("invalid_host")]
    InvalidHost,
    #[error("invalid_url: {0}")]
    Parse(String),
}

fn parse_with_default_scheme(raw: &str) -> Result<Url, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    match Url::parse(trimmed) {
        Ok(url) if url.has_host() => Ok(url),
        Ok(_) => Err(UrlError::InvalidHost),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{trimmed}")).map_err(|e| UrlError::Parse(e.to_string()))
        }
        Err(url::ParseError::EmptyHost) => Err(UrlError::InvalidHost),
        Err(e) => Err(UrlError::Parse(e.to_string())),
    }
}

/// Deterministic URL form used to dedupe sources: lowercase scheme and host,
/// no query or fragment, no default port, single slashes, no trailing slash
/// except for the root path.
pub fn canonicalize_url(raw: &str) -> Result<String, UrlError> {
    let url = parse_with_default_scheme(raw)?;
    let host = url.host_str().ok_or(UrlError::InvalidHost)?.to_ascii_lowercase();
    if host.is_empty() {
        return Err(UrlError::InvalidHost);
    }

    let mut path = String::with_capacity(url.path().len());
    for c in url.path().chars() {
        if c == '/' && path.ends_with('/') {
            continue;
        }
        path.push(c);
    }
    if path.is_empty() {
        path.push('/');
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    Ok(format!("{}://{host}{port}{path}", url.scheme()))
}

/// Bare host for domain matching: no scheme, no leading `www.`, no trailing dot.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let url = parse_with_default_scheme(raw).ok()?;
    let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn trim_trailing_punctuation(input: &str) -> &str {
    input.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':') || c.is_whitespace())
}

/// Lowercased company name with trailing legal-form suffixes removed.
///
/// `"Acme Holdings, Inc."` and `"acme"` normalize to the same key.
pub fn normalize_company_name(name: &str) -> String {
    let mut current = collapse_whitespace(trim_trailing_punctuation(&name.to_lowercase()));
    loop {
        let stripped = LEGAL_SUFFIXES.iter().find_map(|suffix| {
            current
                .strip_suffix(suffix)
                .filter(|rest| rest.ends_with(' '))
                .map(|rest| trim_trailing_punctuation(rest).to_string())
        });
        match stripped {
            Some(next) if !next.is_empty() => current = next,
            _ => break,
        }
    }
    current
}

/// Key used to group prospects without a website: normalized name plus country.
pub fn name_country_key(name_normalized: &str, country: &str) -> (String, String) {
    (
        collapse_whitespace(&name_normalized.to_lowercase()),
        country.trim().to_ascii_uppercase(),
    )
}

/// Slug form of a metric key. Returns an empty string when nothing usable remains.
pub fn normalize_metric_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.trim().to_lowercase().chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            Some(c)
        } else if matches!(c, '_' | '-' | ' ' | '/' | '.' | ':') {
            Some('_')
        } else {
            None
        };
        match mapped {
            Some('_') if out.ends_with('_') => {}
            Some(ch) => out.push(ch),
            None => {}
        }
    }
    out.trim_matches('_').to_string()
}

pub fn is_http_url(raw: &str) -> bool {
    Url::parse(raw.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
        .unwrap_or(false)
}
