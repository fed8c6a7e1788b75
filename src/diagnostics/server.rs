//! Diagnostics HTTP server
//!
//! Liveness for process supervision plus read-only views of module health, module
//! stats, and crash history.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::aggregator::{overall_status, DiagnosticsAggregator};
use super::contract::{ModuleReport, ModuleStatus};
use crate::error::{BotError, Result};
use crate::supervisor::{CrashHandler, CrashRecord, RestartStats, ShutdownSignal};

/// Crash records returned when `limit` is absent
const DEFAULT_CRASH_LIMIT: usize = 10;

/// Shared state for the diagnostics server
pub struct DiagnosticsState {
    pub aggregator: Arc<DiagnosticsAggregator>,
    pub crash_handler: Arc<CrashHandler>,
    pub started_at: DateTime<Utc>,
}

impl DiagnosticsState {
    pub fn new(aggregator: Arc<DiagnosticsAggregator>, crash_handler: Arc<CrashHandler>) -> Self {
        Self {
            aggregator,
            crash_handler,
            started_at: Utc::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ModuleStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub modules: Vec<ModuleReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub timestamp: DateTime<Utc>,
    pub modules: Vec<ModuleReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrashesResponse {
    pub stats: RestartStats,
    pub crashes: Vec<CrashRecord>,
}

#[derive(Debug, Deserialize)]
pub struct CrashQuery {
    pub limit: Option<usize>,
}

/// Routes of the diagnostics server
pub fn router(state: Arc<DiagnosticsState>) -> Router {
    Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/crashes", get(crashes_handler))
        .with_state(state)
}

pub struct DiagnosticsServer {
    state: Arc<DiagnosticsState>,
    addr: SocketAddr,
}

impl DiagnosticsServer {
    pub fn new(state: Arc<DiagnosticsState>, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Parse `bind_address` and `port` into a server
    pub fn bind(state: Arc<DiagnosticsState>, bind_address: &str, port: u16) -> Result<Self> {
        let ip = bind_address.parse().map_err(|e| {
            BotError::InvalidConfig(format!("diagnostics.bind_address {bind_address}: {e}"))
        })?;
        Ok(Self::new(state, SocketAddr::new(ip, port)))
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        let app = router(Arc::clone(&self.state));

        info!("Starting diagnostics server on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .map_err(|e| BotError::Internal(format!("Diagnostics server error: {e}")))?;

        info!("Diagnostics server stopped");
        Ok(())
    }
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Aggregated module health; 503 when any module reports Error
async fn health_handler(State(state): State<Arc<DiagnosticsState>>) -> impl IntoResponse {
    let modules = state.aggregator.aggregate_health().await;
    let status = overall_status(&modules);
    let status_code = match status {
        ModuleStatus::Ok | ModuleStatus::Degraded => StatusCode::OK,
        ModuleStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = HealthResponse {
        status,
        timestamp: Utc::now(),
        uptime_seconds: state.uptime_seconds(),
        modules,
    };
    (status_code, Json(body))
}

async fn stats_handler(State(state): State<Arc<DiagnosticsState>>) -> impl IntoResponse {
    Json(StatsResponse {
        timestamp: Utc::now(),
        modules: state.aggregator.aggregate_stats().await,
    })
}

async fn crashes_handler(
    State(state): State<Arc<DiagnosticsState>>,
    Query(query): Query<CrashQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_CRASH_LIMIT);
    Json(CrashesResponse {
        stats: state.crash_handler.restart_stats(),
        crashes: state.crash_handler.recent_crashes(limit),
    })
}
