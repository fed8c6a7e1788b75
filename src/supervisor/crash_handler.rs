//! Crash Handler
//!
//! Records crashes, decides whether the supervisor restarts the application, and
//! sends best-effort alerts. The restart counter and crash history live here and
//! survive application restarts; nothing is written to disk.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::alert::{AlertKind, AlertPayload, AlertSink};
use crate::error::{panic_message, BotError};

/// Restart policy and alerting settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Crashes tolerated before giving up
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Delay before the first restart in seconds
    #[serde(default = "default_restart_delay_base_secs")]
    pub restart_delay_base_secs: u64,
    /// Upper bound for a single restart delay in seconds
    #[serde(default = "default_restart_delay_max_secs")]
    pub restart_delay_max_secs: u64,
    /// Continuous uptime after which the restart counter resets; `None` or 0 disables
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: Option<u64>,
    /// Per-sink bound on alert delivery
    #[serde(default = "default_alert_timeout_secs")]
    pub alert_timeout_secs: u64,
    /// Grace period for a running instance to finish after a stop request
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Crash records kept in memory
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Chat channel receiving crash alerts
    #[serde(default)]
    pub emergency_channel_id: Option<u64>,
    /// Webhook receiving crash alerts as JSON
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

fn default_max_restart_attempts() -> u32 {
    5
}

fn default_restart_delay_base_secs() -> u64 {
    10
}

fn default_restart_delay_max_secs() -> u64 {
    300
}

fn default_stable_after_secs() -> Option<u64> {
    Some(3_600)
}

fn default_alert_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_history_limit() -> usize {
    10
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay_base_secs: default_restart_delay_base_secs(),
            restart_delay_max_secs: default_restart_delay_max_secs(),
            stable_after_secs: default_stable_after_secs(),
            alert_timeout_secs: default_alert_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            history_limit: default_history_limit(),
            emergency_channel_id: None,
            alert_webhook_url: None,
        }
    }
}

impl SupervisorConfig {
    /// Restart delay for crash number `attempt` (1-based): `base * 2^(attempt-1)`, clamped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let secs = self
            .restart_delay_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.restart_delay_max_secs);
        Duration::from_secs(secs)
    }

    pub fn stable_after(&self) -> Option<Duration> {
        self.stable_after_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What escaped the application
#[derive(Debug)]
pub enum CrashCause {
    Error(BotError),
    Panic(String),
}

impl CrashCause {
    pub fn kind_label(&self) -> &'static str {
        match self {
            CrashCause::Error(e) => e.kind_label(),
            CrashCause::Panic(_) => "panic",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            CrashCause::Error(e) => e.to_string(),
            CrashCause::Panic(message) => format!("panic: {message}"),
        }
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(self, CrashCause::Error(e) if e.is_non_retryable())
    }
}

impl From<BotError> for CrashCause {
    fn from(err: BotError) -> Self {
        CrashCause::Error(err)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error_kind: String,
    pub summary: String,
    pub restart_attempt_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// More crashes than `max_restart_attempts` without a stable run in between
    GaveUp { attempts: u32 },
    /// Restarting cannot fix this (bad credentials, invalid configuration)
    NonRetryable { kind: String },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::GaveUp { attempts } => {
                write!(f, "gave up after {attempts} restart attempts")
            }
            StopReason::NonRetryable { kind } => write!(f, "non-retryable {kind} error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32, delay: Duration },
    Stop(StopReason),
}

/// Counters for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct RestartStats {
    pub restart_count: u32,
    pub max_restart_attempts: u32,
    pub total_crashes: u64,
    pub last_crash_time: Option<DateTime<Utc>>,
    pub current_uptime_secs: i64,
    pub start_time: DateTime<Utc>,
    pub gave_up: bool,
}

#[derive(Debug)]
struct CrashState {
    attempt_count: u32,
    total_crashes: u64,
    history: VecDeque<CrashRecord>,
    last_crash: Option<DateTime<Utc>>,
    run_started_at: DateTime<Utc>,
    gave_up: bool,
}

pub struct CrashHandler {
    config: SupervisorConfig,
    sinks: Vec<Arc<dyn AlertSink>>,
    state: Mutex<CrashState>,
    start_time: DateTime<Utc>,
}

impl CrashHandler {
    pub fn new(config: SupervisorConfig) -> Self {
        let now = Utc::now();
        Self {
            state: Mutex::new(CrashState {
                attempt_count: 0,
                total_crashes: 0,
                history: VecDeque::with_capacity(config.history_limit),
                last_crash: None,
                run_started_at: now,
                gave_up: false,
            }),
            config,
            sinks: Vec::new(),
            start_time: now,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SupervisorConfig::default())
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        info!(sink = sink.name(), "Crash alerts enabled");
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CrashState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a crash and decide what the supervisor does next
    pub async fn handle_crash(&self, cause: &CrashCause) -> RestartDecision {
        let kind = cause.kind_label();
        let summary = cause.summary();

        let (decision, alert) = {
            let mut state = self.lock();
            state.attempt_count = state.attempt_count.saturating_add(1);
            state.total_crashes += 1;
            let attempt = state.attempt_count;
            let record = CrashRecord {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                error_kind: kind.to_string(),
                summary: summary.clone(),
                restart_attempt_number: attempt,
            };
            state.last_crash = Some(record.timestamp);
            state.history.push_back(record);
            while state.history.len() > self.config.history_limit.max(1) {
                state.history.pop_front();
            }

            let stop = if cause.is_non_retryable() {
                Some(StopReason::NonRetryable {
                    kind: kind.to_string(),
                })
            } else if attempt > self.config.max_restart_attempts {
                Some(StopReason::GaveUp {
                    attempts: self.config.max_restart_attempts,
                })
            } else {
                None
            };

            match stop {
                Some(reason) => {
                    let first = !state.gave_up;
                    state.gave_up = true;
                    let alert = first.then(|| {
                        AlertPayload::new(
                            AlertKind::GivingUp,
                            format!("{reason}: {summary}"),
                            attempt,
                        )
                    });
                    (RestartDecision::Stop(reason), alert)
                }
                None => {
                    let delay = self.config.delay_for(attempt);
                    let alert = AlertPayload::new(AlertKind::Crash, summary.clone(), attempt);
                    (RestartDecision::Restart { attempt, delay }, Some(alert))
                }
            }
        };

        match &decision {
            RestartDecision::Restart { attempt, delay } => error!(
                kind,
                attempt,
                max = self.config.max_restart_attempts,
                delay_secs = delay.as_secs(),
                %summary,
                "Application crashed, restart scheduled"
            ),
            RestartDecision::Stop(reason) => error!(kind, %reason, %summary, "Application crashed, not restarting"),
        }

        if let Some(alert) = alert {
            self.dispatch(&alert).await;
        }
        decision
    }

    /// Deliver to every sink concurrently; failures, panics and timeouts are logged only
    async fn dispatch(&self, alert: &AlertPayload) {
        let timeout = Duration::from_secs(self.config.alert_timeout_secs);
        let sends = self.sinks.iter().map(|sink| async move {
            let send = AssertUnwindSafe(sink.send_alert(alert)).catch_unwind();
            match tokio::time::timeout(timeout, send).await {
                Ok(Ok(Ok(()))) => debug!(sink = sink.name(), kind = %alert.kind, "Alert delivered"),
                Ok(Ok(Err(e))) => warn!(sink = sink.name(), kind = %alert.kind, error = %e, "Alert delivery failed"),
                Ok(Err(panic)) => error!(
                    sink = sink.name(),
                    kind = %alert.kind,
                    panic = %panic_message(panic.as_ref()),
                    "Alert sink panicked"
                ),
                Err(_) => warn!(sink = sink.name(), kind = %alert.kind, timeout_secs = timeout.as_secs(), "Alert delivery timed out"),
            }
        });
        join_all(sends).await;
    }

    /// Mark the start of a new application run
    pub fn note_running(&self) {
        self.lock().run_started_at = Utc::now();
    }

    /// Forget past crashes after a stable run
    pub fn reset_attempts(&self) {
        let mut state = self.lock();
        if state.attempt_count > 0 {
            info!(previous = state.attempt_count, "Restart counter reset after stable run");
        }
        state.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.lock().attempt_count
    }

    /// Up to `limit` crash records, newest first
    pub fn recent_crashes(&self, limit: usize) -> Vec<CrashRecord> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn restart_stats(&self) -> RestartStats {
        let state = self.lock();
        RestartStats {
            restart_count: state.attempt_count,
            max_restart_attempts: self.config.max_restart_attempts,
            total_crashes: state.total_crashes,
            last_crash_time: state.last_crash,
            current_uptime_secs: (Utc::now() - state.run_started_at).num_seconds(),
            start_time: self.start_time,
            gave_up: state.gave_up,
        }
    }
}
