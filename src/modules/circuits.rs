//! Circuit breaker states as a diagnostics module

use async_trait::async_trait;
use std::sync::Arc;

use crate::diagnostics::{HealthReporter, ModuleReport, ModuleStatus};
use crate::resilience::{CircuitBreaker, CircuitState};

pub struct CircuitsModule {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitsModule {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

fn severity(state: CircuitState) -> ModuleStatus {
    match state {
        CircuitState::Closed => ModuleStatus::Ok,
        CircuitState::HalfOpen => ModuleStatus::Degraded,
        CircuitState::Open => ModuleStatus::Error,
    }
}

#[async_trait]
impl HealthReporter for CircuitsModule {
    fn name(&self) -> &str {
        "circuits"
    }

    async fn health(&self) -> ModuleReport {
        let snapshots = self.breaker.snapshots();
        let mut report = ModuleReport::ok(self.name()).with("circuits", snapshots.len());
        let mut open = Vec::new();
        for snap in &snapshots {
            let state = snap.effective_state();
            report = report
                .with(&snap.resource, state.to_string())
                .escalate(severity(state));
            if state == CircuitState::Open {
                open.push(match snap.retry_in_secs {
                    Some(secs) => format!("{} (retry in {secs}s)", snap.resource),
                    None => snap.resource.clone(),
                });
            }
        }
        if !open.is_empty() {
            report.error_message = Some(format!("open circuits: {}", open.join(", ")));
        }
        report
    }

    async fn stats(&self) -> ModuleReport {
        let config = self.breaker.config();
        let mut report = ModuleReport::ok(self.name())
            .with("failure_threshold", config.failure_threshold)
            .with("open_seconds", config.open_seconds)
            .with("half_open_probes", config.half_open_probes);
        for snap in self.breaker.snapshots() {
            report = report
                .with(&format!("{}.failures", snap.resource), snap.consecutive_failures)
                .with(&format!("{}.trips", snap.resource), snap.total_trips);
        }
        report
    }
}
