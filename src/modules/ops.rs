//! Operations module: crash handler counters in the diagnostics view

use async_trait::async_trait;
use std::sync::Arc;

use crate::diagnostics::{HealthReporter, ModuleReport, ModuleStatus};
use crate::supervisor::CrashHandler;

pub struct OpsModule {
    crash_handler: Arc<CrashHandler>,
}

impl OpsModule {
    pub fn new(crash_handler: Arc<CrashHandler>) -> Self {
        Self { crash_handler }
    }
}

#[async_trait]
impl HealthReporter for OpsModule {
    fn name(&self) -> &str {
        "ops"
    }

    async fn health(&self) -> ModuleReport {
        let stats = self.crash_handler.restart_stats();
        // Any restart since process start leaves ops degraded.
        let status = if stats.restart_count > 0 {
            ModuleStatus::Degraded
        } else {
            ModuleStatus::Ok
        };
        ModuleReport::new(self.name(), status)
            .with(
                "restarts",
                format!("{}/{}", stats.restart_count, stats.max_restart_attempts),
            )
            .with("current_uptime_secs", stats.current_uptime_secs)
    }

    async fn stats(&self) -> ModuleReport {
        let stats = self.crash_handler.restart_stats();
        let last_crash_kind = self
            .crash_handler
            .recent_crashes(1)
            .into_iter()
            .next()
            .map(|c| c.error_kind);
        ModuleReport::ok(self.name())
            .with("restart_count", stats.restart_count)
            .with("max_restart_attempts", stats.max_restart_attempts)
            .with("total_crashes", stats.total_crashes)
            .with("current_uptime_secs", stats.current_uptime_secs)
            .with("start_time", stats.start_time.to_rfc3339())
            .with("last_crash_time", stats.last_crash_time.map(|t| t.to_rfc3339()))
            .with("last_crash_kind", last_crash_kind)
    }
}
