//! Guarded HTTP client
//!
//! Every request runs through the retry loop, and every attempt through the named
//! circuit. Responses other than 2xx/304 become [`BotError::HttpStatus`] so they can
//! be classified and counted against the circuit.

use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{BotError, Result};
use crate::resilience::{CircuitBreaker, FailureClass, Retrier, RetryPolicy};

/// Transport settings for outbound HTTP
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("oilwatch/{} (Discord Bot)", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Validators from a previous response, sent back for conditional GETs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Successful (2xx or 304) response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub validators: Validators,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

/// HTTP client whose calls are protected by a circuit breaker and retry policy
pub struct GuardedHttpClient {
    client: Client,
    retrier: Retrier,
}

impl GuardedHttpClient {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy, config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            retrier: Retrier::new(policy).with_breaker(breaker),
        })
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Plain GET
    pub async fn get(&self, resource: &str, url: &str) -> Result<HttpResponse> {
        self.get_conditional(resource, url, &Validators::default())
            .await
    }

    /// GET with `If-None-Match` / `If-Modified-Since` taken from `validators`
    pub async fn get_conditional(
        &self,
        resource: &str,
        url: &str,
        validators: &Validators,
    ) -> Result<HttpResponse> {
        self.send(resource, |client| {
            let mut request = client
                .get(url)
                .header(reqwest::header::CACHE_CONTROL, "no-cache");
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(last_modified) = &validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
            request
        })
        .await
    }

    /// Send a request built fresh for every attempt
    pub async fn send<F>(&self, resource: &str, build: F) -> Result<HttpResponse>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.retrier
            .execute(
                resource,
                |_| perform(resource, build(&self.client)),
                classify_http_error,
            )
            .await
    }
}

async fn perform(resource: &str, request: RequestBuilder) -> Result<HttpResponse> {
    let started = Instant::now();
    let response = request.send().await?;
    let status = response.status();

    if !(status.is_success() || status == StatusCode::NOT_MODIFIED) {
        return Err(BotError::HttpStatus {
            resource: resource.to_string(),
            status: status.as_u16(),
            retry_after: parse_retry_after(response.headers()),
        });
    }

    let validators = Validators {
        etag: header_string(response.headers(), ETAG),
        last_modified: header_string(response.headers(), LAST_MODIFIED),
    };
    let body = response.text().await?;
    let elapsed = started.elapsed();
    debug!(resource, status = status.as_u16(), elapsed_ms = elapsed.as_millis() as u64, "HTTP response");

    Ok(HttpResponse {
        status: status.as_u16(),
        body,
        validators,
        elapsed,
    })
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Statuses worth retrying
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// `Retry-After` in (possibly fractional) seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 && secs < 86_400.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Map an HTTP failure to its retry class
pub fn classify_http_error(err: &BotError) -> FailureClass {
    match err {
        BotError::HttpStatus {
            status: 429,
            retry_after,
            ..
        } => FailureClass::RateLimited {
            retry_after: *retry_after,
        },
        BotError::HttpStatus { status, .. } if is_transient_status(*status) => {
            FailureClass::Retryable
        }
        BotError::HttpStatus { .. } => FailureClass::Fatal,
        BotError::Http(e) if e.is_builder() || e.is_redirect() || e.is_decode() => {
            FailureClass::Fatal
        }
        // Timeouts, connection refused/reset, truncated bodies.
        BotError::Http(_) => FailureClass::Retryable,
        BotError::Timeout { .. } => FailureClass::Retryable,
        _ => FailureClass::Fatal,
    }
}
