//! Supervision layer
//!
//! - Crash handler: crash records, restart decisions with exponential backoff
//! - Supervisor: runs the application, catches escaping errors and panics
//! - Alert sinks for crash and giving-up notifications

pub mod alert;
pub mod crash_handler;
pub mod runner;

pub use alert::{AlertKind, AlertPayload, AlertSink, PlatformAlertSink, WebhookAlertSink};
pub use crash_handler::{
    CrashCause, CrashHandler, CrashRecord, RestartDecision, RestartStats, StopReason,
    SupervisorConfig,
};
pub use runner::{
    RunContext, ShutdownSignal, StopHandle, Supervisor, SupervisorOutcome, SupervisorState,
    SupervisorStats, EXIT_GAVE_UP, EXIT_NON_RETRYABLE,
};
