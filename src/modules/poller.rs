//! Endpoint poller
//!
//! Polls one URL through the guarded HTTP client with conditional requests and
//! posts a notice to a chat channel when the content changes. After a few unchanged
//! polls in a row the interval relaxes; any change resets it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::{GuardedHttpClient, GuardedPlatformClient, Validators};
use crate::config::PollerConfig;
use crate::diagnostics::{HealthReporter, ModuleReport, ModuleStatus};
use crate::error::{BotError, Result};
use crate::resilience::CircuitState;
use crate::supervisor::ShutdownSignal;

/// Consecutive failed polls that turn a degraded poller into an error
const FAILURES_BEFORE_ERROR: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Changed { hash: String },
    Unchanged,
    NotModified,
}

/// First 16 hex characters of the SHA-256 of `content`
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}

#[derive(Debug, Default)]
struct PollState {
    validators: Validators,
    last_hash: Option<String>,
    unchanged_streak: u32,
    relaxed: bool,
    polls: u64,
    changes: u64,
    not_modified: u64,
    failures: u64,
    skipped: u64,
    consecutive_failures: u32,
    notices_sent: u64,
    notice_failures: u64,
    last_success: Option<DateTime<Utc>>,
    last_change: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct EndpointPoller {
    config: PollerConfig,
    url: String,
    http: Arc<GuardedHttpClient>,
    notifier: Option<(GuardedPlatformClient, u64)>,
    state: Mutex<PollState>,
}

impl EndpointPoller {
    pub fn new(config: PollerConfig, http: Arc<GuardedHttpClient>) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| BotError::InvalidConfig("poller.url is not set".to_string()))?;
        Ok(Self {
            config,
            url,
            http,
            notifier: None,
            state: Mutex::new(PollState::default()),
        })
    }

    /// Post a notice to `channel_id` whenever the content changes
    pub fn with_notifier(mut self, platform: GuardedPlatformClient, channel_id: u64) -> Self {
        self.notifier = Some((platform, channel_id));
        self
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    pub fn relaxed_interval(&self) -> Duration {
        self.base_interval() * self.config.relaxed_multiplier.max(1)
    }

    /// Delay before the next poll
    pub fn current_interval(&self) -> Duration {
        if self.lock().relaxed {
            self.relaxed_interval()
        } else {
            self.base_interval()
        }
    }

    /// Fetch once and update change-detection state
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let validators = self.lock().validators.clone();
        let result = self
            .http
            .get_conditional(&self.config.resource, &self.url, &validators)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let mut state = self.lock();
                state.polls += 1;
                if matches!(e, BotError::CircuitOpen { .. }) {
                    state.skipped += 1;
                    debug!(resource = %self.config.resource, "Circuit open, poll skipped");
                } else {
                    state.failures += 1;
                    state.consecutive_failures += 1;
                    warn!(resource = %self.config.resource, error = %e, "Poll failed");
                }
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let outcome = {
            let mut state = self.lock();
            state.polls += 1;
            state.consecutive_failures = 0;
            state.last_error = None;
            state.last_success = Some(Utc::now());

            let outcome = if response.is_not_modified() {
                state.not_modified += 1;
                PollOutcome::NotModified
            } else {
                let hash = content_hash(&response.body);
                if !response.validators.is_empty() {
                    state.validators = response.validators.clone();
                }
                if state.last_hash.as_deref() == Some(hash.as_str()) {
                    PollOutcome::Unchanged
                } else {
                    state.last_hash = Some(hash.clone());
                    PollOutcome::Changed { hash }
                }
            };

            match &outcome {
                PollOutcome::Changed { hash } => {
                    state.changes += 1;
                    state.last_change = Some(Utc::now());
                    state.unchanged_streak = 0;
                    if state.relaxed {
                        debug!("Content changed, back to base polling interval");
                    }
                    state.relaxed = false;
                    info!(resource = %self.config.resource, hash = %&hash[..8], "Content changed");
                }
                PollOutcome::Unchanged | PollOutcome::NotModified => {
                    state.unchanged_streak += 1;
                    if !state.relaxed && state.unchanged_streak >= self.config.unchanged_before_relax {
                        state.relaxed = true;
                        debug!(
                            unchanged = state.unchanged_streak,
                            interval_secs = self.relaxed_interval().as_secs(),
                            "No changes, using relaxed polling interval"
                        );
                    }
                }
            }
            outcome
        };

        // The first fetch only establishes a baseline.
        let has_baseline = self.lock().changes > 1;
        if let PollOutcome::Changed { hash } = &outcome {
            if has_baseline {
                self.notify_change(hash).await;
            }
        }
        Ok(outcome)
    }

    async fn notify_change(&self, hash: &str) {
        let Some((platform, channel_id)) = &self.notifier else {
            return;
        };
        let message = format!(
            "Update detected at {} (`{}`)",
            self.config.resource,
            &hash[..8]
        );
        let sent = platform.send_message(*channel_id, &message).await;
        let mut state = self.lock();
        match sent {
            Ok(()) => state.notices_sent += 1,
            Err(e) => {
                state.notice_failures += 1;
                warn!(channel_id, error = %e, "Change notice not delivered");
            }
        }
    }

    /// Poll until shutdown. Poll failures are recorded, never returned.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            url = %self.url,
            interval_secs = self.config.interval_secs,
            "Endpoint poller started"
        );
        loop {
            if shutdown.is_set() {
                break;
            }
            // Errors are already logged and counted.
            let _ = self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.current_interval()) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!("Endpoint poller stopped");
        Ok(())
    }

    fn circuit_state(&self) -> CircuitState {
        self.http
            .retrier()
            .breaker()
            .and_then(|b| b.snapshot(&self.config.resource))
            .map(|snap| snap.effective_state())
            .unwrap_or(CircuitState::Closed)
    }
}

#[async_trait]
impl HealthReporter for EndpointPoller {
    fn name(&self) -> &str {
        "poller"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn health(&self) -> ModuleReport {
        let circuit = self.circuit_state();
        let state = self.lock();
        let status = if circuit == CircuitState::Open
            || state.consecutive_failures >= FAILURES_BEFORE_ERROR
        {
            ModuleStatus::Error
        } else if state.consecutive_failures > 0 || circuit == CircuitState::HalfOpen {
            ModuleStatus::Degraded
        } else {
            ModuleStatus::Ok
        };
        let mut report = ModuleReport::new(self.name(), status)
            .with("url", self.url.as_str())
            .with("circuit", circuit.to_string())
            .with("relaxed", state.relaxed)
            .with("current_interval_secs", self.current_interval_secs(state.relaxed))
            .with("last_hash", state.last_hash.as_deref().map(|h| &h[..8]))
            .with("last_success", state.last_success.map(|t| t.to_rfc3339()));
        if status != ModuleStatus::Ok {
            report.error_message = state.last_error.clone();
        }
        report
    }

    async fn stats(&self) -> ModuleReport {
        let state = self.lock();
        ModuleReport::ok(self.name())
            .with("polls", state.polls)
            .with("changes", state.changes)
            .with("not_modified", state.not_modified)
            .with("failures", state.failures)
            .with("skipped_circuit_open", state.skipped)
            .with("unchanged_streak", state.unchanged_streak)
            .with("notices_sent", state.notices_sent)
            .with("notice_failures", state.notice_failures)
            .with("last_change", state.last_change.map(|t| t.to_rfc3339()))
    }
}

impl EndpointPoller {
    fn current_interval_secs(&self, relaxed: bool) -> u64 {
        if relaxed {
            self.relaxed_interval().as_secs()
        } else {
            self.config.interval_secs
        }
    }
}
