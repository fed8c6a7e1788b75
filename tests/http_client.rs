use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use oilwatch::clients::{ChatPlatform, GuardedHttpClient, GuardedPlatformClient, HttpConfig};
use oilwatch::config::PollerConfig;
use oilwatch::error::{BotError, Result};
use oilwatch::modules::{EndpointPoller, PollOutcome};
use oilwatch::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureClass, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};

#[derive(Default)]
struct Upstream {
    flaky_hits: AtomicU32,
    missing_hits: AtomicU32,
    limited_hits: AtomicU32,
    prices_hits: AtomicU32,
    prices: Mutex<(u32, String)>,
}

async fn flaky(State(up): State<Arc<Upstream>>) -> StatusCode {
    up.flaky_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::SERVICE_UNAVAILABLE
}

async fn missing(State(up): State<Arc<Upstream>>) -> StatusCode {
    up.missing_hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

async fn limited(State(up): State<Arc<Upstream>>) -> Response {
    if up.limited_hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response();
    }
    "ok".into_response()
}

async fn prices(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    up.prices_hits.fetch_add(1, Ordering::SeqCst);
    let (version, body) = up.prices.lock().unwrap().clone();
    let etag = format!("\"v{version}\"");
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some(etag.as_str());
    if matches {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }
    ([(header::ETAG, etag)], body).into_response()
}

async fn spawn_upstream() -> (Arc<Upstream>, String) {
    let upstream = Arc::new(Upstream {
        prices: Mutex::new((1, "Brent 82.10".to_string())),
        ..Default::default()
    });
    let app = Router::new()
        .route("/flaky", get(flaky))
        .route("/missing", get(missing))
        .route("/limited", get(limited))
        .route("/prices", get(prices))
        .with_state(upstream.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (upstream, format!("http://{addr}"))
}

fn client(failure_threshold: u32, max_attempts: u32) -> (Arc<CircuitBreaker>, GuardedHttpClient) {
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold,
        open_seconds: 60,
        half_open_probes: 1,
    }));
    let policy = RetryPolicy {
        max_attempts,
        base_delay_ms: 5,
        max_delay_ms: 20,
        jitter: false,
    };
    let http = GuardedHttpClient::new(breaker.clone(), policy, &HttpConfig::default()).unwrap();
    (breaker, http)
}

#[tokio::test]
async fn server_errors_are_retried_until_attempts_run_out() {
    let (upstream, base) = spawn_upstream().await;
    let (_, http) = client(10, 3);

    let err = http.get("oil-api", &format!("{base}/flaky")).await.unwrap_err();

    match err {
        BotError::RetriesExhausted { attempts, kind, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(kind, FailureClass::Retryable);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(upstream.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (upstream, base) = spawn_upstream().await;
    let (_, http) = client(10, 3);

    let err = assert_err!(http.get("oil-api", &format!("{base}/missing")).await);

    assert!(matches!(err, BotError::HttpStatus { status: 404, .. }));
    assert_eq!(upstream.missing_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limit_waits_then_succeeds() {
    let (upstream, base) = spawn_upstream().await;
    let (_, http) = client(10, 3);

    let response = assert_ok!(http.get("oil-api", &format!("{base}/limited")).await);

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    assert_eq!(upstream.limited_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn open_circuit_fails_fast_without_network() {
    let (upstream, base) = spawn_upstream().await;
    let (breaker, http) = client(3, 1);
    let url = format!("{base}/flaky");

    for _ in 0..3 {
        assert!(http.get("oil-api", &url).await.is_err());
    }
    assert_eq!(breaker.state("oil-api"), CircuitState::Open);

    let err = http.get("oil-api", &url).await.unwrap_err();

    assert!(matches!(err, BotError::CircuitOpen { .. }));
    assert_eq!(upstream.flaky_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conditional_get_returns_not_modified() {
    let (upstream, base) = spawn_upstream().await;
    let (_, http) = client(10, 1);
    let url = format!("{base}/prices");

    let first = http.get("oil-api", &url).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.validators.etag.as_deref(), Some("\"v1\""));

    let second = http
        .get_conditional("oil-api", &url, &first.validators)
        .await
        .unwrap();
    assert!(second.is_not_modified());
    assert!(second.body.is_empty());
    assert_eq!(upstream.prices_hits.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct RecordingPlatform {
    messages: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel_id, content.to_string()));
        Ok(())
    }

    async fn rename_channel(&self, _channel_id: u64, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn poller_notifies_on_change_and_relaxes_when_quiet() {
    let (upstream, base) = spawn_upstream().await;
    let (_, http) = client(10, 1);
    let platform = Arc::new(RecordingPlatform::default());
    let notifier = GuardedPlatformClient::new(platform.clone(), RetryPolicy::default());
    let poller = EndpointPoller::new(
        PollerConfig {
            enabled: true,
            url: Some(format!("{base}/prices")),
            interval_secs: 60,
            relaxed_multiplier: 3,
            unchanged_before_relax: 2,
            ..Default::default()
        },
        Arc::new(http),
    )
    .unwrap()
    .with_notifier(notifier, 42);

    // The first fetch is only a baseline.
    assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Changed { .. }));
    assert!(platform.messages.lock().unwrap().is_empty());

    assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotModified);
    assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::NotModified);
    assert_eq!(poller.current_interval(), poller.relaxed_interval());

    *upstream.prices.lock().unwrap() = (2, "Brent 84.55".to_string());
    assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Changed { .. }));
    assert_eq!(poller.current_interval(), poller.base_interval());

    let messages = platform.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 42);
    assert!(messages[0].1.contains("oil-api"));
}
