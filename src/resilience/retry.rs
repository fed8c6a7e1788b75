//! Retry with exponential backoff
//!
//! [`RetryPolicy`] computes delays; [`Retrier`] runs an attempt function until it
//! succeeds, hits a fatal failure, or uses up its attempts. Each attempt can be
//! routed through a [`CircuitBreaker`], in which case an open circuit ends the
//! loop immediately without touching the network.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::error::{BotError, Result};

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient (timeouts, 5xx, connection resets) - retry with backoff
    Retryable,
    /// Upstream asked us to slow down; wait the hinted delay when present
    RateLimited { retry_after: Option<Duration> },
    /// Not worth retrying (bad credentials, malformed request)
    Fatal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Retryable => write!(f, "retryable"),
            FailureClass::RateLimited { .. } => write!(f, "rate-limited"),
            FailureClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Backoff and attempt-count parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single computed delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to 20% random jitter on top of each computed delay
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = scaled.min(self.max_delay_ms);
        let jitter = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped / 5)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    /// Worst-case time spent sleeping across all retries, ignoring jitter and rate limits
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| {
                Duration::from_millis(
                    self.base_delay_ms
                        .saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
                        .min(self.max_delay_ms),
                )
            })
            .sum()
    }
}

/// Runs attempts under a [`RetryPolicy`], optionally guarded by a circuit breaker
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
        }
    }

    /// Route every attempt through `breaker`
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run `attempt_fn` (called with the 1-based attempt number) until it succeeds.
    ///
    /// `Fatal` failures and open circuits return immediately. Retryable and rate-limited
    /// failures are retried until `max_attempts` is reached, after which the last error is
    /// returned wrapped in [`BotError::RetriesExhausted`] with its classification.
    pub async fn execute<T, F, Fut, C>(
        &self,
        resource: &str,
        mut attempt_fn: F,
        classify: C,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&BotError) -> FailureClass,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match &self.breaker {
                Some(breaker) => breaker.guard(resource, || attempt_fn(attempt)).await,
                None => attempt_fn(attempt).await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(resource, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if matches!(err, BotError::CircuitOpen { .. }) {
                return Err(err);
            }

            let class = classify(&err);
            if class == FailureClass::Fatal {
                warn!(resource, attempt, error = %err, "Fatal failure, not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(resource, attempts = attempt, kind = %class, error = %err, "Retries exhausted");
                return Err(BotError::RetriesExhausted {
                    resource: resource.to_string(),
                    attempts: attempt,
                    kind: class,
                    source: Box::new(err),
                });
            }

            let delay = match class {
                FailureClass::RateLimited {
                    retry_after: Some(retry_after),
                } => retry_after,
                _ => self.policy.delay_for(attempt),
            };
            warn!(
                resource,
                attempt,
                max_attempts,
                kind = %class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// [`Retrier::execute`] bounded by an overall deadline.
    ///
    /// When the deadline passes, the in-flight attempt or backoff sleep is dropped and
    /// [`BotError::Timeout`] is returned.
    pub async fn execute_within<T, F, Fut, C>(
        &self,
        resource: &str,
        timeout: Duration,
        attempt_fn: F,
        classify: C,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&BotError) -> FailureClass,
    {
        match tokio::time::timeout(timeout, self.execute(resource, attempt_fn, classify)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(resource, ?timeout, "Overall deadline exceeded, retries cancelled");
                Err(BotError::Timeout {
                    resource: resource.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_attempts: u32, base_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }

    fn always(class: FailureClass) -> impl Fn(&BotError) -> FailureClass {
        move |_| class
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(200), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(5, 1_000)
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay <= Duration::from_millis(2_400));
        }
    }

    #[test]
    fn test_max_total_delay() {
        assert_eq!(policy(4, 100).max_total_delay(), Duration::from_millis(700));
        assert_eq!(policy(1, 100).max_total_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_uses_every_attempt() {
        let retrier = Retrier::new(policy(4, 100));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = retrier
            .execute(
                "oil-api",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::Internal("503".into()))
                },
                always(FailureClass::Retryable),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        match result {
            Err(BotError::RetriesExhausted { attempts, kind, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(kind, FailureClass::Retryable);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let retrier = Retrier::new(policy(5, 100));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retrier
            .execute(
                "oil-api",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::Auth("401".into()))
                },
                always(FailureClass::Fatal),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BotError::Auth(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_hinted_delay() {
        let retrier = Retrier::new(policy(3, 100));
        let started = Instant::now();

        let value = retrier
            .execute(
                "discord",
                |attempt| async move {
                    if attempt == 1 {
                        Err(BotError::Internal("429".into()))
                    } else {
                        Ok(attempt)
                    }
                },
                always(FailureClass::RateLimited {
                    retry_after: Some(Duration::from_secs(7)),
                }),
            )
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_all_attempts() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_seconds: 60,
            half_open_probes: 1,
        }));
        breaker
            .guard("oil-api", || async { Err::<(), _>(BotError::Internal("down".into())) })
            .await
            .ok();

        let retrier = Retrier::new(policy(5, 100)).with_breaker(breaker);
        let calls = AtomicU32::new(0);
        let result: Result<()> = retrier
            .execute(
                "oil-api",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                always(FailureClass::Retryable),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(BotError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_tripping_mid_loop_stops_retries() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            open_seconds: 600,
            half_open_probes: 1,
        }));
        let retrier = Retrier::new(policy(5, 100)).with_breaker(breaker);
        let calls = AtomicU32::new(0);

        let result: Result<()> = retrier
            .execute(
                "oil-api",
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::Internal("timeout".into()))
                },
                always(FailureClass::Retryable),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(BotError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_remaining_retries() {
        let retrier = Retrier::new(policy(10, 1_000));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retrier
            .execute_within(
                "oil-api",
                Duration::from_millis(2_500),
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BotError::Internal("503".into()))
                },
                always(FailureClass::Retryable),
            )
            .await;

        // Attempts at t=0s, 1s and 3s would be needed; the deadline hits first.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(BotError::Timeout { .. })));
    }
}
