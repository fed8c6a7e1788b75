//! Diagnostics aggregation across registered modules
//!
//! Every module is asked concurrently. A module that panics, hangs past the
//! per-module timeout, or returns an error report becomes an `Error` entry; it never
//! breaks the aggregate for the others.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::contract::{HealthReporter, ModuleReport, ModuleStatus, Scalar};
use crate::error::panic_message;

#[derive(Debug, Clone, Copy)]
enum Probe {
    Health,
    Stats,
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Probe::Health => write!(f, "health"),
            Probe::Stats => write!(f, "stats"),
        }
    }
}

/// Combined health and stats of every registered module
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedReport {
    pub generated_at: DateTime<Utc>,
    pub overall: ModuleStatus,
    pub health: Vec<ModuleReport>,
    pub stats: Vec<ModuleReport>,
}

/// Worst status among `reports`, `Ok` when empty
pub fn overall_status(reports: &[ModuleReport]) -> ModuleStatus {
    reports
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(ModuleStatus::Ok)
}

pub struct DiagnosticsAggregator {
    modules: Vec<Arc<dyn HealthReporter>>,
    module_timeout: Duration,
}

impl DiagnosticsAggregator {
    pub fn new(module_timeout: Duration) -> Self {
        Self {
            modules: Vec::new(),
            module_timeout,
        }
    }

    /// Register a module. Reports keep registration order.
    pub fn register(&mut self, module: Arc<dyn HealthReporter>) {
        debug!(module = module.name(), "Registered diagnostics module");
        self.modules.push(module);
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module_timeout(&self) -> Duration {
        self.module_timeout
    }

    pub async fn aggregate_health(&self) -> Vec<ModuleReport> {
        self.collect(Probe::Health).await
    }

    pub async fn aggregate_stats(&self) -> Vec<ModuleReport> {
        self.collect(Probe::Stats).await
    }

    /// Health and stats together, with the worst status across both
    pub async fn aggregate(&self) -> AggregatedReport {
        let (health, stats) = tokio::join!(self.aggregate_health(), self.aggregate_stats());
        let overall = overall_status(&health).max(overall_status(&stats));
        AggregatedReport {
            generated_at: Utc::now(),
            overall,
            health,
            stats,
        }
    }

    async fn collect(&self, probe: Probe) -> Vec<ModuleReport> {
        join_all(self.modules.iter().map(|m| self.check(m.as_ref(), probe))).await
    }

    async fn check(&self, module: &dyn HealthReporter, probe: Probe) -> ModuleReport {
        let name = module.name().to_string();
        let call = async {
            match probe {
                Probe::Health => module.health().await,
                Probe::Stats => module.stats().await,
            }
        };

        let mut report = match tokio::time::timeout(
            self.module_timeout,
            AssertUnwindSafe(call).catch_unwind(),
        )
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(module = %name, %probe, %message, "Diagnostics check panicked");
                ModuleReport::error(&name, format!("{probe} check panicked: {message}"))
            }
            Err(_) => {
                warn!(module = %name, %probe, timeout_ms = self.module_timeout.as_millis() as u64, "Diagnostics check timed out");
                ModuleReport::error(
                    &name,
                    format!(
                        "{probe} check timed out after {}ms",
                        self.module_timeout.as_millis()
                    ),
                )
            }
        };

        // The registry name wins over whatever the module put in its report.
        report.module = name;
        report
            .details
            .entry("enabled".to_string())
            .or_insert(Scalar::Bool(module.enabled()));
        report
    }
}
