use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use rip_core::{FailureKind, Validators};
use rip_fetch::{FailureCode, FetchPolicyConfig, FetchPolicyEngine, FetchResult};
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

fn engine(config: FetchPolicyConfig) -> FetchPolicyEngine {
    FetchPolicyEngine::new(config).unwrap()
}

fn text(body: &'static str) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

#[tokio::test]
async fn second_fetch_with_etag_is_not_modified() {
    let router = Router::new().route(
        "/doc",
        get(|headers: HeaderMap| async move {
            if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some("\"v1\"") {
                return StatusCode::NOT_MODIFIED.into_response();
            }
            (
                [(header::CONTENT_TYPE, "text/plain"), (header::ETAG, "\"v1\"")],
                "versioned body",
            )
                .into_response()
        }),
    );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());
    let url = format!("{base}/doc");

    let first = engine.fetch(Uuid::new_v4(), &url, &Validators::default()).await;
    let FetchResult::Fetched(body) = &first.result else {
        panic!("expected a body, got {:?}", first.result);
    };
    assert_eq!(body.etag.as_deref(), Some("\"v1\""));
    assert_eq!(first.robots_cache_hit, Some(false));

    let validators = Validators {
        etag: body.etag.clone(),
        pending_recheck: true,
        ..Validators::default()
    };
    let second = engine.fetch(Uuid::new_v4(), &url, &validators).await;
    assert_eq!(second.result, FetchResult::NotModified { status: 304 });
    assert_eq!(second.events_of("not_modified").count(), 1);
    assert_eq!(second.robots_cache_hit, Some(true));
}

#[tokio::test]
async fn robots_disallow_is_terminal_and_cached() {
    let router = Router::new()
        .route("/robots.txt", get(|| async { text("User-agent: *\nDisallow: /private\n") }))
        .route("/private/report", get(|| async { text("secret") }))
        .route("/public", get(|| async { text("hello") }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let blocked = engine
        .fetch(Uuid::new_v4(), &format!("{base}/private/report"), &Validators::default())
        .await;
    let failure = blocked.failure().expect("robots failure");
    assert_eq!(failure.code, FailureCode::RobotsDisallowed);
    assert_eq!(failure.kind, FailureKind::Terminal);
    assert_eq!(blocked.events_of("robots_fetched").count(), 1);
    assert_eq!(blocked.events_of("robots_disallowed").count(), 1);

    let allowed = engine
        .fetch(Uuid::new_v4(), &format!("{base}/public"), &Validators::default())
        .await;
    assert!(allowed.is_success());
    assert_eq!(allowed.events_of("robots_cache_hit").count(), 1);
}

#[tokio::test]
async fn missing_robots_allows_fetching() {
    let router = Router::new().route("/page", get(|| async { text("plain page") }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/page"), &Validators::default())
        .await;
    assert!(outcome.is_success());
    assert_eq!(outcome.events_of("robots_missing_or_unreachable").count(), 1);
}

#[tokio::test]
async fn redirect_loop_is_detected() {
    let router = Router::new()
        .route("/a", get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/b")]) }))
        .route("/b", get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/a")]) }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/a"), &Validators::default())
        .await;
    assert_eq!(outcome.failure().unwrap().code, FailureCode::RedirectLoopDetected);
    assert_eq!(outcome.redirect_chain.len(), 2);
    assert_eq!(outcome.redirect_chain[0].status, 302);
}

#[tokio::test]
async fn redirect_chain_over_the_limit_fails() {
    let router = Router::new().route(
        "/hop/{n}",
        get(|axum::extract::Path(n): axum::extract::Path<u32>| async move {
            (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, format!("/hop/{}", n + 1))])
        }),
    );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig {
        max_redirects: 2,
        ..FetchPolicyConfig::default()
    });

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/hop/0"), &Validators::default())
        .await;
    assert_eq!(outcome.failure().unwrap().code, FailureCode::RedirectLimitExceeded);
    assert_eq!(outcome.redirect_chain.len(), 3);
}

#[tokio::test]
async fn redirects_are_followed_and_final_url_canonicalized() {
    let router = Router::new()
        .route("/old", get(|| async { (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, "/new/?ref=1")]) }))
        .route("/new/", get(|| async { text("moved here") }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/old"), &Validators::default())
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.result);
    assert_eq!(outcome.final_url, format!("{base}/new/?ref=1"));
    assert_eq!(outcome.canonical_final_url, Some(format!("{base}/new")));
    assert_eq!(outcome.requested_url, format!("{base}/old"));
}

#[tokio::test]
async fn redirect_without_location_fails() {
    let router = Router::new().route("/nowhere", get(|| async { StatusCode::FOUND }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/nowhere"), &Validators::default())
        .await;
    assert_eq!(outcome.failure().unwrap().code, FailureCode::RedirectMissingLocation);
}

#[tokio::test]
async fn validators_are_not_forwarded_to_redirect_targets() {
    let router = Router::new()
        .route("/moved", get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/target")]) }))
        .route(
            "/target",
            get(|headers: HeaderMap| async move {
                if headers.contains_key(header::IF_NONE_MATCH) || headers.contains_key(header::IF_MODIFIED_SINCE) {
                    return StatusCode::NOT_MODIFIED.into_response();
                }
                text("fresh target").into_response()
            }),
        );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());
    let validators = Validators {
        etag: Some("\"stale\"".to_string()),
        last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
        pending_recheck: true,
        ..Validators::default()
    };

    let outcome = engine.fetch(Uuid::new_v4(), &format!("{base}/moved"), &validators).await;
    let FetchResult::Fetched(body) = &outcome.result else {
        panic!("expected a body, got {:?}", outcome.result);
    };
    assert_eq!(body.body, b"fresh target");
    assert_eq!(outcome.redirect_chain.len(), 1);
}

#[tokio::test]
async fn not_modified_without_validators_is_unexpected() {
    let router = Router::new().route("/cached", get(|| async { StatusCode::NOT_MODIFIED }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/cached"), &Validators::default())
        .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.code, FailureCode::UnexpectedStatus);
    assert_eq!(failure.kind, FailureKind::Terminal);
    assert_eq!(failure.http_status, Some(304));
    assert_eq!(outcome.events_of("not_modified").count(), 0);
}

#[tokio::test]
async fn disallowed_content_type_is_rejected_before_reading() {
    let router = Router::new().route(
        "/image",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0u8; 64]) }),
    );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/image"), &Validators::default())
        .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.code, FailureCode::UnsupportedContentType);
    assert_eq!(failure.kind, FailureKind::Terminal);
    assert_eq!(failure.bytes_read, Some(0));
}

#[tokio::test]
async fn oversized_body_aborts() {
    let router = Router::new().route(
        "/big",
        get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "x".repeat(5_000)) }),
    );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig {
        max_bytes: 1_024,
        ..FetchPolicyConfig::default()
    });

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/big"), &Validators::default())
        .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.code, FailureCode::FetchTooLarge);
    assert!(failure.bytes_read.is_some());
}

#[tokio::test]
async fn retry_after_is_reported_as_retryable() {
    let router = Router::new().route(
        "/busy",
        get(|| async { (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")], "slow down") }),
    );
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/busy"), &Validators::default())
        .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.code, FailureCode::RateLimited);
    assert_eq!(failure.kind, FailureKind::Retryable);
    assert_eq!(failure.retry_after, Some(Duration::from_secs(1)));
    assert_eq!(failure.http_status, Some(429));
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let router = Router::new().route("/gone", get(|| async { StatusCode::GONE }));
    let base = spawn(router).await;
    let engine = engine(FetchPolicyConfig::default());

    let outcome = engine
        .fetch(Uuid::new_v4(), &format!("{base}/gone"), &Validators::default())
        .await;
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.code, FailureCode::HttpClientError);
    assert_eq!(failure.kind, FailureKind::Terminal);
}

#[tokio::test]
async fn same_domain_requests_are_serialized() {
    let spans: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = spans.clone();
    let router = Router::new().route(
        "/slow/{n}",
        get(move || {
            let recorded = recorded.clone();
            async move {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(200)).await;
                recorded.lock().await.push((start, Instant::now()));
                text("slow page")
            }
        }),
    );
    let base = spawn(router).await;
    let engine = Arc::new(engine(FetchPolicyConfig {
        per_domain_concurrency: 1,
        ..FetchPolicyConfig::default()
    }));

    let run_id = Uuid::new_v4();
    let first_url = format!("{base}/slow/1");
    let second_url = format!("{base}/slow/2");
    let validators = Validators::default();
    let (first, second) = tokio::join!(
        engine.fetch(run_id, &first_url, &validators),
        engine.fetch(run_id, &second_url, &validators),
    );
    assert!(first.is_success() && second.is_success());

    let spans = spans.lock().await;
    assert_eq!(spans.len(), 2);
    let (earlier, later) = if spans[0].0 <= spans[1].0 {
        (spans[0], spans[1])
    } else {
        (spans[1], spans[0])
    };
    assert!(later.0 >= earlier.1, "second request started before the first finished");

    let waited: Vec<u64> = first
        .events_of("domain_rate_limited")
        .chain(second.events_of("domain_rate_limited"))
        .filter_map(|e| e.output["waited_ms"].as_u64())
        .collect();
    assert!(waited.iter().any(|ms| *ms > 0), "expected a rate-limit wait, got {waited:?}");
}
