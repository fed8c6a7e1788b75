//! Chat platform client with retry and rate-limit handling
//!
//! [`ChatPlatform`] is the narrow surface the bot needs from Discord (send a message,
//! rename a channel, check credentials). [`GuardedPlatformClient`] wraps any
//! implementation with a retry policy that honours the platform's `retry_after` hints.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::http::{classify_http_error, is_transient_status, parse_retry_after};
use crate::error::{BotError, Result};
use crate::resilience::{CircuitBreaker, FailureClass, Retrier, RetryPolicy};

/// Outbound operations on the chat platform
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Resource name used for logging and circuit bookkeeping
    fn name(&self) -> &str;

    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()>;

    async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<()>;

    /// Check that the configured credentials are accepted
    async fn verify(&self) -> Result<()>;
}

/// Discord connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Bot token; alerts and notices are skipped when absent
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Channel that receives content-change notices
    #[serde(default)]
    pub notify_channel_id: Option<u64>,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
            notify_channel_id: None,
        }
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct RenameBody<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    message: Option<String>,
}

/// Discord REST implementation of [`ChatPlatform`]
pub struct DiscordRest {
    client: Client,
    api_base: String,
    token: String,
}

impl DiscordRest {
    pub fn new(api_base: &str, token: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn check(response: Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(BotError::Auth("Discord rejected the bot token".to_string()));
        }

        let header_hint = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<RateLimitBody>(&body).ok();
        let body_hint = parsed
            .as_ref()
            .and_then(|b| b.retry_after)
            .filter(|secs| secs.is_finite() && *secs >= 0.0 && *secs < 86_400.0)
            .map(Duration::from_secs_f64);
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| body.chars().take(200).collect());

        Err(BotError::Platform {
            status: Some(status.as_u16()),
            retry_after: header_hint.or(body_hint),
            message,
        })
    }
}

#[async_trait]
impl ChatPlatform for DiscordRest {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&MessageBody { content })
            .send()
            .await?;
        Self::check(response).await
    }

    async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<()> {
        let response = self
            .client
            .patch(format!("{}/channels/{}", self.api_base, channel_id))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&RenameBody { name })
            .send()
            .await?;
        Self::check(response).await
    }

    async fn verify(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        Self::check(response).await
    }
}

/// Map a platform failure to its retry class
pub fn classify_platform_error(err: &BotError) -> FailureClass {
    match err {
        BotError::Platform {
            status: Some(429),
            retry_after,
            ..
        } => FailureClass::RateLimited {
            retry_after: *retry_after,
        },
        BotError::Platform {
            status: Some(status),
            ..
        } if is_transient_status(*status) => FailureClass::Retryable,
        // Forbidden, unknown channel, malformed payload.
        BotError::Platform { .. } => FailureClass::Fatal,
        BotError::Http(_) => classify_http_error(err),
        _ => FailureClass::Fatal,
    }
}

/// [`ChatPlatform`] calls with retry, backoff and rate-limit waits
#[derive(Clone)]
pub struct GuardedPlatformClient {
    platform: Arc<dyn ChatPlatform>,
    retrier: Retrier,
}

impl GuardedPlatformClient {
    pub fn new(platform: Arc<dyn ChatPlatform>, policy: RetryPolicy) -> Self {
        Self {
            platform,
            retrier: Retrier::new(policy),
        }
    }

    /// Also route platform calls through a circuit named after the platform
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.retrier = self.retrier.with_breaker(breaker);
        self
    }

    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    pub async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        let platform = self.platform.as_ref();
        self.retrier
            .execute(
                platform.name(),
                |_| platform.send_message(channel_id, content),
                classify_platform_error,
            )
            .await?;
        debug!(channel_id, "Message delivered");
        Ok(())
    }

    pub async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<()> {
        let platform = self.platform.as_ref();
        self.retrier
            .execute(
                platform.name(),
                |_| platform.rename_channel(channel_id, name),
                classify_platform_error,
            )
            .await?;
        info!(channel_id, name, "Channel renamed");
        Ok(())
    }

    pub async fn verify(&self) -> Result<()> {
        let platform = self.platform.as_ref();
        self.retrier
            .execute(platform.name(), |_| platform.verify(), classify_platform_error)
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{platform_error, ScriptedPlatform};
    use super::*;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_send_waits_retry_after() {
        let platform = Arc::new(ScriptedPlatform::new(vec![Err(platform_error(
            429,
            Some(Duration::from_secs(4)),
        ))]));
        let client = GuardedPlatformClient::new(platform.clone(), policy(5));
        let started = Instant::now();

        client.send_message(42, "hello").await.unwrap();

        assert_eq!(platform.calls(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_is_not_retried() {
        let platform = Arc::new(ScriptedPlatform::new(vec![Err(platform_error(403, None))]));
        let client = GuardedPlatformClient::new(platform.clone(), policy(5));

        let err = client.rename_channel(42, "oil-42").await.unwrap_err();

        assert_eq!(platform.calls(), 1);
        assert!(err.user_hint().contains("permission"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_attempts() {
        let platform = Arc::new(ScriptedPlatform::new(
            (0..3).map(|_| Err(platform_error(502, None))).collect(),
        ));
        let client = GuardedPlatformClient::new(platform.clone(), policy(3));
        let started = Instant::now();

        let err = client.send_message(1, "x").await.unwrap_err();

        assert_eq!(platform.calls(), 3);
        // 500ms + 1000ms of backoff between the three attempts
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
        assert!(matches!(
            err,
            BotError::RetriesExhausted {
                attempts: 3,
                kind: FailureClass::Retryable,
                ..
            }
        ));
    }

    #[test]
    fn test_platform_classification() {
        assert_eq!(
            classify_platform_error(&platform_error(429, None)),
            FailureClass::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify_platform_error(&platform_error(504, None)),
            FailureClass::Retryable
        );
        assert_eq!(
            classify_platform_error(&platform_error(404, None)),
            FailureClass::Fatal
        );
        assert_eq!(
            classify_platform_error(&BotError::Auth("bad token".into())),
            FailureClass::Fatal
        );
    }
}
