//! Outbound crash alerts
//!
//! Alerts are best-effort. The crash handler bounds every send with a timeout and
//! only logs failures, so a sink is free to return errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::clients::GuardedPlatformClient;
use crate::error::{BotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    Crash,
    GivingUp,
}

impl AlertKind {
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertKind::Crash => "\u{26a0}\u{fe0f}",
            AlertKind::GivingUp => "\u{1f6a8}",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Crash => write!(f, "crash"),
            AlertKind::GivingUp => write!(f, "giving-up"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub kind: AlertKind,
    pub summary: String,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
}

impl AlertPayload {
    pub fn new(kind: AlertKind, summary: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            kind,
            summary: summary.into(),
            attempt_number,
            timestamp: Utc::now(),
        }
    }

    /// Chat-friendly rendering, kept under Discord's 2000 character limit
    pub fn format_message(&self) -> String {
        let title = match self.kind {
            AlertKind::Crash => "Bot crashed",
            AlertKind::GivingUp => "Bot stopped, restart attempts exhausted",
        };
        let summary: String = self.summary.chars().take(1_500).collect();
        format!(
            "{} **{}** (attempt {})\n**Time:** {}\n```\n{}\n```",
            self.kind.emoji(),
            title,
            self.attempt_number,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            summary
        )
    }
}

/// Destination for supervisor alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send_alert(&self, payload: &AlertPayload) -> Result<()>;
}

/// Posts alerts to an emergency chat channel
pub struct PlatformAlertSink {
    client: GuardedPlatformClient,
    channel_id: u64,
}

impl PlatformAlertSink {
    pub fn new(client: GuardedPlatformClient, channel_id: u64) -> Self {
        Self { client, channel_id }
    }
}

#[async_trait]
impl AlertSink for PlatformAlertSink {
    fn name(&self) -> &str {
        self.client.platform_name()
    }

    async fn send_alert(&self, payload: &AlertPayload) -> Result<()> {
        self.client
            .send_message(self.channel_id, &payload.format_message())
            .await
    }
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: String,
    alert: &'a AlertPayload,
}

/// POSTs alerts as JSON to a webhook URL
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_alert(&self, payload: &AlertPayload) -> Result<()> {
        let message = WebhookMessage {
            content: payload.format_message(),
            alert: payload,
        };
        let resp = self.client.post(&self.url).json(&message).send().await?;
        let status = resp.status();
        if status.is_success() {
            debug!(kind = %payload.kind, "Webhook alert sent");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BotError::Internal(format!(
            "webhook returned HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )))
    }
}
