//! Polite single-URL fetching: robots, redirects, content gating,
//! conditional revalidation and per-domain rate limiting.
//!
//! [`FetchPolicyEngine::fetch`] never returns an error for expected policy
//! outcomes. Everything it observed comes back in a [`FetchOutcome`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
    RETRY_AFTER,
};
use reqwest::{StatusCode, Url};
use rip_core::normalize::canonicalize_url;
use rip_core::{EventStatus, FailureKind, RedirectHop, Validators};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod artifact;
pub mod limiter;
pub mod robots;

pub use artifact::{extension_for_mime, ArtifactStore, StoredArtifact};
pub use limiter::DomainLimiter;
pub use robots::{RobotsCache, RobotsRules};

pub const CRATE_NAME: &str = "rip-fetch";

const REDIRECT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

#[derive(Debug, Clone)]
pub struct FetchPolicyConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub per_domain_min_delay: Duration,
    pub robots_ttl: Duration,
    pub robots_negative_ttl: Duration,
}

impl Default for FetchPolicyConfig {
    fn default() -> Self {
        Self {
            user_agent: "rip-research-bot/0.1".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 5,
            max_bytes: 2_000_000,
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/pdf".to_string(),
                "text/plain".to_string(),
            ],
            global_concurrency: 8,
            per_domain_concurrency: 1,
            per_domain_min_delay: Duration::ZERO,
            robots_ttl: Duration::from_secs(3600),
            robots_negative_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Stable failure codes stored as `last_error` on source documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    RobotsDisallowed,
    RedirectLoopDetected,
    RedirectLimitExceeded,
    RedirectMissingLocation,
    UnsupportedContentType,
    FetchTooLarge,
    HttpClientError,
    HttpServerError,
    RateLimited,
    Timeout,
    NetworkError,
    InvalidUrl,
    /// 304 to a request that carried no validators.
    UnexpectedStatus,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RobotsDisallowed => "robots_disallowed",
            Self::RedirectLoopDetected => "redirect_loop_detected",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::RedirectMissingLocation => "redirect_missing_location",
            Self::UnsupportedContentType => "unsupported_content_type",
            Self::FetchTooLarge => "fetch_too_large",
            Self::HttpClientError => "http_client_error",
            Self::HttpServerError => "http_server_error",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::InvalidUrl => "invalid_url",
            Self::UnexpectedStatus => "unexpected_status",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub code: FailureCode,
    pub kind: FailureKind,
    pub http_status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub bytes_read: Option<u64>,
    pub message: String,
}

impl FetchFailure {
    fn terminal(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: FailureKind::Terminal,
            http_status: None,
            retry_after: None,
            bytes_read: None,
            message: message.into(),
        }
    }

    fn retryable(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            ..Self::terminal(code, message)
        }
    }

    fn with_status(mut self, status: StatusCode) -> Self {
        self.http_status = Some(status.as_u16());
        self
    }

    fn with_bytes_read(mut self, bytes_read: u64) -> Self {
        self.bytes_read = Some(bytes_read);
        self
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            FailureCode::Timeout
        } else {
            FailureCode::NetworkError
        };
        match classify_reqwest_error(err) {
            RetryDisposition::Retryable => Self::retryable(code, err.to_string()),
            RetryDisposition::NonRetryable => Self::terminal(code, err.to_string()),
        }
    }

    fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        let code = if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some())
        {
            FailureCode::RateLimited
        } else if status.is_server_error() {
            FailureCode::HttpServerError
        } else {
            FailureCode::HttpClientError
        };
        let message = format!("http status {}", status.as_u16());
        let failure = match classify_status(status) {
            RetryDisposition::Retryable => Self::retryable(code, message),
            RetryDisposition::NonRetryable => Self::terminal(code, message),
        };
        Self {
            retry_after,
            ..failure.with_status(status)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBody {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Fetched(FetchedBody),
    NotModified { status: u16 },
    Failed(FetchFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchEvent {
    pub event_type: &'static str,
    pub status: EventStatus,
    pub input: Value,
    pub output: Value,
}

/// Everything observed while fetching one URL.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub requested_url: String,
    pub final_url: String,
    pub canonical_final_url: Option<String>,
    pub redirect_chain: Vec<RedirectHop>,
    /// Robots cache result for the first hop; `None` if the URL never got that far.
    pub robots_cache_hit: Option<bool>,
    pub events: Vec<FetchEvent>,
    pub elapsed: Duration,
    pub result: FetchResult,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.result, FetchResult::Failed(_))
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match &self.result {
            FetchResult::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn events_of(&self, event_type: &str) -> impl Iterator<Item = &FetchEvent> {
        let event_type = event_type.to_string();
        self.events.iter().filter(move |e| e.event_type == event_type)
    }
}

struct OutcomeBuilder {
    requested_url: String,
    redirect_chain: Vec<RedirectHop>,
    robots_cache_hit: Option<bool>,
    events: Vec<FetchEvent>,
    started: Instant,
}

impl OutcomeBuilder {
    fn new(url: &str) -> Self {
        Self {
            requested_url: url.to_string(),
            redirect_chain: Vec::new(),
            robots_cache_hit: None,
            events: Vec::new(),
            started: Instant::now(),
        }
    }

    fn event(&mut self, event_type: &'static str, status: EventStatus, input: Value, output: Value) {
        self.events.push(FetchEvent {
            event_type,
            status,
            input,
            output,
        });
    }

    fn finish(self, final_url: &str, result: FetchResult) -> FetchOutcome {
        FetchOutcome {
            requested_url: self.requested_url,
            final_url: final_url.to_string(),
            canonical_final_url: canonicalize_url(final_url).ok(),
            redirect_chain: self.redirect_chain,
            robots_cache_hit: self.robots_cache_hit,
            events: self.events,
            elapsed: self.started.elapsed(),
            result,
        }
    }

    fn fail(mut self, final_url: &str, failure: FetchFailure) -> FetchOutcome {
        self.event(
            "fetch_failed",
            EventStatus::Failed,
            json!({"url": final_url}),
            json!({
                "code": failure.code.as_str(),
                "kind": failure.kind.as_str(),
                "http_status": failure.http_status,
                "bytes_read": failure.bytes_read,
                "retry_after_seconds": failure.retry_after.map(|d| d.as_secs()),
                "message": failure.message,
            }),
        );
        self.finish(final_url, FetchResult::Failed(failure))
    }
}

#[derive(Debug, Error)]
pub enum FetchSetupError {
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Parses `Retry-After` as delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// MIME essence: lowercase, parameters stripped.
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    }
}

fn robots_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

#[derive(Debug)]
pub struct FetchPolicyEngine {
    client: reqwest::Client,
    robots_client: reqwest::Client,
    config: FetchPolicyConfig,
    limiter: DomainLimiter,
    robots: Arc<RobotsCache>,
}

impl FetchPolicyEngine {
    pub fn new(config: FetchPolicyConfig) -> Result<Self, FetchSetupError> {
        let robots = Arc::new(RobotsCache::new(config.robots_ttl, config.robots_negative_ttl));
        Self::with_robots_cache(config, robots)
    }

    pub fn with_robots_cache(
        config: FetchPolicyConfig,
        robots: Arc<RobotsCache>,
    ) -> Result<Self, FetchSetupError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let robots_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects.max(1)))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let limiter = DomainLimiter::new(
            config.global_concurrency,
            config.per_domain_concurrency,
            config.per_domain_min_delay,
        );

        Ok(Self {
            client,
            robots_client,
            config,
            limiter,
            robots,
        })
    }

    pub fn config(&self) -> &FetchPolicyConfig {
        &self.config
    }

    pub fn robots_cache(&self) -> &Arc<RobotsCache> {
        &self.robots
    }

    pub async fn fetch(&self, run_id: Uuid, url: &str, validators: &Validators) -> FetchOutcome {
        let span = info_span!("http_fetch", %run_id, url);
        let outcome = self.fetch_inner(url, validators).instrument(span).await;
        match &outcome.result {
            FetchResult::Fetched(body) => info!(
                %run_id,
                url,
                status = body.status,
                bytes = body.body.len(),
                hops = outcome.redirect_chain.len(),
                "fetched source"
            ),
            FetchResult::NotModified { .. } => debug!(%run_id, url, "source not modified"),
            FetchResult::Failed(failure) => warn!(
                %run_id,
                url,
                code = failure.code.as_str(),
                kind = failure.kind.as_str(),
                "fetch failed"
            ),
        }
        outcome
    }

    async fn fetch_inner(&self, url: &str, validators: &Validators) -> FetchOutcome {
        let mut outcome = OutcomeBuilder::new(url);
        let mut current = match Url::parse(url.trim()) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => parsed,
            Ok(_) => {
                return outcome.fail(
                    url,
                    FetchFailure::terminal(FailureCode::InvalidUrl, "only http(s) urls with a host are fetchable"),
                )
            }
            Err(err) => return outcome.fail(url, FetchFailure::terminal(FailureCode::InvalidUrl, err.to_string())),
        };

        let mut visited: HashSet<String> = HashSet::from([current.as_str().to_string()]);
        loop {
            let domain = current.host_str().unwrap_or_default().to_ascii_lowercase();
            let permit = match self.limiter.acquire(&domain).await {
                Ok(permit) => permit,
                Err(err) => {
                    return outcome.fail(
                        current.as_str(),
                        FetchFailure::retryable(FailureCode::NetworkError, err.to_string()),
                    )
                }
            };
            if permit.waited >= Duration::from_millis(1) {
                outcome.event(
                    "domain_rate_limited",
                    EventStatus::Warn,
                    json!({"url": current.as_str()}),
                    json!({"domain": domain, "waited_ms": permit.waited.as_millis() as u64}),
                );
            }

            if !self.robots_allows(&current, &mut outcome).await {
                return outcome.fail(
                    current.as_str(),
                    FetchFailure::terminal(FailureCode::RobotsDisallowed, "disallowed by robots.txt"),
                );
            }

            // Validators belong to the requested resource, not to redirect targets.
            let mut request = self.client.get(current.clone());
            let mut conditional = false;
            if outcome.redirect_chain.is_empty() {
                if let Some(etag) = &validators.etag {
                    request = request.header(IF_NONE_MATCH, etag.as_str());
                    conditional = true;
                }
                if let Some(last_modified) = &validators.last_modified {
                    request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
                    conditional = true;
                }
            }

            let mut response = match request.send().await {
                Ok(response) => response,
                Err(err) => return outcome.fail(current.as_str(), FetchFailure::from_reqwest(&err)),
            };
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                if !conditional {
                    return outcome.fail(
                        current.as_str(),
                        FetchFailure::terminal(FailureCode::UnexpectedStatus, "304 without a conditional request")
                            .with_status(status),
                    );
                }
                outcome.event(
                    "not_modified",
                    EventStatus::Ok,
                    json!({"url": current.as_str(), "etag": validators.etag, "last_modified": validators.last_modified}),
                    json!({"status": status.as_u16()}),
                );
                return outcome.finish(current.as_str(), FetchResult::NotModified { status: status.as_u16() });
            }

            if REDIRECT_STATUSES.contains(&status) {
                let Some(location) = header_string(response.headers(), LOCATION) else {
                    return outcome.fail(
                        current.as_str(),
                        FetchFailure::terminal(FailureCode::RedirectMissingLocation, "redirect without Location")
                            .with_status(status),
                    );
                };
                let next = match current.join(&location) {
                    Ok(next) => next,
                    Err(err) => {
                        return outcome.fail(
                            current.as_str(),
                            FetchFailure::terminal(FailureCode::InvalidUrl, format!("bad Location {location}: {err}"))
                                .with_status(status),
                        )
                    }
                };
                outcome.redirect_chain.push(RedirectHop {
                    from: current.to_string(),
                    to: next.to_string(),
                    status: status.as_u16(),
                });
                if !visited.insert(next.as_str().to_string()) {
                    return outcome.fail(
                        next.as_str(),
                        FetchFailure::terminal(FailureCode::RedirectLoopDetected, "redirect target already visited")
                            .with_status(status),
                    );
                }
                if outcome.redirect_chain.len() > self.config.max_redirects {
                    return outcome.fail(
                        next.as_str(),
                        FetchFailure::terminal(
                            FailureCode::RedirectLimitExceeded,
                            format!("more than {} redirects", self.config.max_redirects),
                        )
                        .with_status(status),
                    );
                }
                drop(permit);
                current = next;
                continue;
            }

            if !status.is_success() {
                let retry_after = header_string(response.headers(), RETRY_AFTER)
                    .and_then(|value| parse_retry_after(&value, Utc::now()));
                return outcome.fail(current.as_str(), FetchFailure::from_status(status, retry_after));
            }

            let content_type = header_string(response.headers(), CONTENT_TYPE)
                .map(|v| mime_essence(&v))
                .unwrap_or_default();
            if !self
                .config
                .allowed_content_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
            {
                return outcome.fail(
                    current.as_str(),
                    FetchFailure::terminal(
                        FailureCode::UnsupportedContentType,
                        format!("content type {content_type:?} is not allowed"),
                    )
                    .with_status(status)
                    .with_bytes_read(0),
                );
            }

            let max_bytes = self.config.max_bytes;
            if let Some(declared) = response.content_length().filter(|len| *len > max_bytes) {
                return outcome.fail(
                    current.as_str(),
                    FetchFailure::terminal(
                        FailureCode::FetchTooLarge,
                        format!("declared length {declared} exceeds {max_bytes}"),
                    )
                    .with_status(status)
                    .with_bytes_read(0),
                );
            }

            let etag = header_string(response.headers(), ETAG);
            let last_modified = header_string(response.headers(), LAST_MODIFIED);
            let mut body = Vec::new();
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        let total = (body.len() + chunk.len()) as u64;
                        if total > max_bytes {
                            return outcome.fail(
                                current.as_str(),
                                FetchFailure::terminal(
                                    FailureCode::FetchTooLarge,
                                    format!("body exceeds {max_bytes} bytes"),
                                )
                                .with_status(status)
                                .with_bytes_read(total),
                            );
                        }
                        body.extend_from_slice(&chunk);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        return outcome.fail(
                            current.as_str(),
                            FetchFailure::from_reqwest(&err).with_bytes_read(body.len() as u64),
                        )
                    }
                }
            }
            drop(permit);

            outcome.event(
                "fetch_succeeded",
                EventStatus::Ok,
                json!({"url": current.as_str()}),
                json!({
                    "status": status.as_u16(),
                    "content_type": content_type,
                    "bytes_read": body.len(),
                    "redirects": outcome.redirect_chain.len(),
                }),
            );
            return outcome.finish(
                current.as_str(),
                FetchResult::Fetched(FetchedBody {
                    status: status.as_u16(),
                    content_type,
                    body,
                    etag,
                    last_modified,
                }),
            );
        }
    }

    async fn robots_allows(&self, url: &Url, outcome: &mut OutcomeBuilder) -> bool {
        let origin = origin_of(url);
        let rules = match self.robots.get(&origin).await {
            Some(rules) => {
                outcome.robots_cache_hit.get_or_insert(true);
                outcome.event("robots_cache_hit", EventStatus::Ok, json!({"origin": origin}), Value::Null);
                rules
            }
            None => {
                outcome.robots_cache_hit.get_or_insert(false);
                outcome.event("robots_cache_miss", EventStatus::Ok, json!({"origin": origin}), Value::Null);
                self.load_robots(&origin, outcome).await
            }
        };

        let path = robots_path(url);
        let allowed = rules.is_allowed(&self.config.user_agent, &path);
        if !allowed {
            outcome.event(
                "robots_disallowed",
                EventStatus::Failed,
                json!({"url": url.as_str(), "path": path}),
                Value::Null,
            );
        }
        allowed
    }

    async fn load_robots(&self, origin: &str, outcome: &mut OutcomeBuilder) -> Arc<RobotsRules> {
        let robots_url = format!("{origin}/robots.txt");
        let missing_reason = match self.robots_client.get(&robots_url).send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => {
                        let rules = Arc::new(RobotsRules::parse(&body));
                        self.robots.insert(origin, rules.clone()).await;
                        outcome.event(
                            "robots_fetched",
                            EventStatus::Ok,
                            json!({"robots_url": robots_url}),
                            json!({"status": status, "bytes": body.len()}),
                        );
                        return rules;
                    }
                    Err(err) => json!({"error": err.to_string()}),
                }
            }
            Ok(response) => json!({"status": response.status().as_u16()}),
            Err(err) => json!({"error": err.to_string()}),
        };

        outcome.event(
            "robots_missing_or_unreachable",
            EventStatus::Warn,
            json!({"robots_url": robots_url}),
            missing_reason,
        );
        self.robots.insert_missing(origin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).single().unwrap();
        assert_eq!(parse_retry_after("1", now), Some(Duration::from_secs(1)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);

        let limited = FetchFailure::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)));
        assert_eq!(limited.code, FailureCode::RateLimited);
        assert_eq!(limited.kind, FailureKind::Retryable);
        let gone = FetchFailure::from_status(StatusCode::GONE, None);
        assert_eq!(gone.code, FailureCode::HttpClientError);
        assert_eq!(gone.kind, FailureKind::Terminal);
    }

    #[test]
    fn mime_essence_strips_parameters() {
        assert_eq!(mime_essence("Text/HTML; charset=utf-8"), "text/html");
        assert_eq!(mime_essence(""), "");
    }
}
