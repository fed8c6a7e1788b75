//! Module health contract, aggregation, and the diagnostics HTTP surface

pub mod aggregator;
pub mod contract;
pub mod server;

pub use aggregator::{overall_status, AggregatedReport, DiagnosticsAggregator};
pub use contract::{
    HealthReporter, ModuleHealthReport, ModuleReport, ModuleStatsReport, ModuleStatus, Scalar,
};
pub use server::{router, DiagnosticsServer, DiagnosticsState};
