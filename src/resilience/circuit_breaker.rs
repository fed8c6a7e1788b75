//! Named Circuit Breakers
//!
//! One circuit per upstream resource ("oil-api", "discord", ...), created lazily on
//! first use. A circuit stops calls to a failing resource for a cooldown period and
//! then lets a limited number of probe calls through to decide whether it recovered.
//!
//! State lives behind one `std::sync::Mutex` per circuit. The lock is only held for
//! the synchronous check-and-set around a call, never across an `.await`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BotError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls pass
    Closed,
    /// Failure threshold exceeded - calls fail fast
    Open,
    /// Cooldown elapsed - limited probe calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration shared by every circuit of a breaker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing probes
    #[serde(default = "default_open_seconds")]
    pub open_seconds: u64,
    /// Probe calls allowed per half-open cycle (at least 1)
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_open_seconds() -> u64 {
    120
}

fn default_half_open_probes() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_seconds: default_open_seconds(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_seconds)
    }

    fn probe_budget(&self) -> u32 {
        self.half_open_probes.max(1)
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Admitted while closed
    Normal,
    /// Admitted as a half-open probe in the given cycle
    Probe { cycle: u64 },
}

#[derive(Debug)]
struct Circuit {
    resource: String,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    half_open_probes_issued: u32,
    half_open_cycle: u64,
    total_trips: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl Circuit {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_wall: None,
            half_open_probes_issued: 0,
            half_open_cycle: 0,
            total_trips: 0,
            last_success: None,
            last_failure: None,
        }
    }

    fn retry_in(&self, now: Instant, config: &CircuitBreakerConfig) -> Duration {
        match self.opened_at {
            Some(opened_at) => config
                .open_duration()
                .saturating_sub(now.saturating_duration_since(opened_at)),
            None => Duration::ZERO,
        }
    }

    /// Decide whether a call may proceed. `Err` carries the time until the next probe window.
    fn try_acquire(
        &mut self,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> std::result::Result<Admission, Duration> {
        if self.state == CircuitState::Open {
            let retry_in = self.retry_in(now, config);
            if !retry_in.is_zero() {
                return Err(retry_in);
            }
            self.state = CircuitState::HalfOpen;
            self.half_open_probes_issued = 0;
            self.half_open_cycle += 1;
            info!(resource = %self.resource, "Circuit breaker transitioning to HALF-OPEN");
        }

        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => {
                if self.half_open_probes_issued >= config.probe_budget() {
                    // Rejections do not consume probe budget.
                    return Err(Duration::ZERO);
                }
                self.half_open_probes_issued += 1;
                debug!(
                    resource = %self.resource,
                    probe = self.half_open_probes_issued,
                    "Half-open probe admitted"
                );
                Ok(Admission::Probe {
                    cycle: self.half_open_cycle,
                })
            }
            CircuitState::Open => Err(self.retry_in(now, config)),
        }
    }

    fn on_success(&mut self, admission: Admission) {
        self.last_success = Some(Utc::now());
        match (self.state, admission) {
            (CircuitState::Closed, _) => self.consecutive_failures = 0,
            (CircuitState::HalfOpen, Admission::Probe { cycle }) if cycle == self.half_open_cycle => {
                self.close();
                warn!(resource = %self.resource, "Circuit breaker CLOSED after successful probe");
            }
            // Late result of a call admitted before the circuit tripped.
            _ => debug!(resource = %self.resource, state = %self.state, "Ignoring stale success"),
        }
    }

    fn on_failure(&mut self, admission: Admission, now: Instant, config: &CircuitBreakerConfig) {
        self.last_failure = Some(Utc::now());
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.consecutive_failures += 1;
                debug!(
                    resource = %self.resource,
                    failures = self.consecutive_failures,
                    "Circuit breaker failure recorded"
                );
                if self.consecutive_failures >= config.failure_threshold {
                    self.trip(now);
                    warn!(
                        resource = %self.resource,
                        failures = self.consecutive_failures,
                        open_seconds = config.open_seconds,
                        "Circuit breaker TRIPPED"
                    );
                }
            }
            (CircuitState::HalfOpen, Admission::Probe { cycle }) if cycle == self.half_open_cycle => {
                self.consecutive_failures += 1;
                self.trip(now);
                warn!(
                    resource = %self.resource,
                    open_seconds = config.open_seconds,
                    "Circuit breaker re-opened after failed probe"
                );
            }
            _ => debug!(resource = %self.resource, state = %self.state, "Ignoring stale failure"),
        }
    }

    /// Give back the slot of a probe that never reported an outcome.
    fn release_probe(&mut self, cycle: u64) {
        if self.state == CircuitState::HalfOpen
            && cycle == self.half_open_cycle
            && self.half_open_probes_issued > 0
        {
            self.half_open_probes_issued -= 1;
            debug!(resource = %self.resource, "Abandoned probe released");
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.half_open_probes_issued = 0;
        self.total_trips += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.half_open_probes_issued = 0;
    }

    fn snapshot(&self, now: Instant, config: &CircuitBreakerConfig) -> CircuitSnapshot {
        CircuitSnapshot {
            resource: self.resource.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            half_open_probes_issued: self.half_open_probes_issued,
            opened_at: self.opened_at_wall,
            retry_in_secs: (self.state == CircuitState::Open)
                .then(|| self.retry_in(now, config).as_secs()),
            probe_ready: self.state == CircuitState::Open
                && self.retry_in(now, config).is_zero(),
            total_trips: self.total_trips,
            last_success: self.last_success,
            last_failure: self.last_failure,
        }
    }
}

/// Read-only view of one circuit for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probes_issued: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub retry_in_secs: Option<u64>,
    /// Open, but the cooldown has passed and the next call will be a probe
    pub probe_ready: bool,
    pub total_trips: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl CircuitSnapshot {
    /// State the next call will see. An open circuit past its cooldown counts as
    /// half-open even before a call performs the transition.
    pub fn effective_state(&self) -> CircuitState {
        if self.probe_ready {
            CircuitState::HalfOpen
        } else {
            self.state
        }
    }
}

fn lock(circuit: &Mutex<Circuit>) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission ticket for one guarded call.
///
/// Dropping an unsettled probe permit (the call was cancelled) returns the probe slot.
struct Permit {
    circuit: Arc<Mutex<Circuit>>,
    admission: Admission,
    settled: bool,
}

impl Permit {
    fn settle(&mut self, success: bool, config: &CircuitBreakerConfig) {
        let mut circuit = lock(&self.circuit);
        if success {
            circuit.on_success(self.admission);
        } else {
            circuit.on_failure(self.admission, Instant::now(), config);
        }
        self.settled = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Admission::Probe { cycle } = self.admission {
            lock(&self.circuit).release_probe(cycle);
        }
    }
}

/// Circuit breaker registry keyed by resource name
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, resource: &str) -> Arc<Mutex<Circuit>> {
        if let Some(existing) = self.circuits.get(resource) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(resource))))
                .value(),
        )
    }

    fn acquire(&self, resource: &str) -> Result<Permit> {
        let circuit = self.circuit(resource);
        let admission = lock(&circuit).try_acquire(Instant::now(), &self.config);
        match admission {
            Ok(admission) => Ok(Permit {
                circuit,
                admission,
                settled: false,
            }),
            Err(retry_in) => {
                debug!(resource, ?retry_in, "Circuit open, failing fast");
                Err(BotError::CircuitOpen {
                    resource: resource.to_string(),
                    retry_in,
                })
            }
        }
    }

    /// Run `operation` under the named circuit.
    ///
    /// Fails with [`BotError::CircuitOpen`] without calling `operation` when the circuit
    /// is open or its half-open probe budget is used up. Otherwise the operation's
    /// outcome is recorded against the circuit and returned unchanged.
    pub async fn guard<T, F, Fut>(&self, resource: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire(resource)?;
        let outcome = operation().await;
        permit.settle(outcome.is_ok(), &self.config);
        outcome
    }

    /// Current state of a circuit (`Closed` for resources never used)
    pub fn state(&self, resource: &str) -> CircuitState {
        self.circuits
            .get(resource)
            .map(|c| lock(c.value()).state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, resource: &str) -> Option<CircuitSnapshot> {
        let now = Instant::now();
        self.circuits
            .get(resource)
            .map(|c| lock(c.value()).snapshot(now, &self.config))
    }

    /// Snapshots of every known circuit, ordered by resource name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|c| lock(c.value()).snapshot(now, &self.config))
            .collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource));
        all
    }

    /// Force a circuit closed (manual intervention)
    pub fn reset(&self, resource: &str) {
        if let Some(circuit) = self.circuits.get(resource) {
            lock(circuit.value()).close();
            warn!(resource, "Circuit breaker force-closed");
        }
    }
}
