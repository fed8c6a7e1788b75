//! Health and stats contract implemented by every feature module

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Module status, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Ok,
    Degraded,
    Error,
}

impl ModuleStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ModuleStatus::Ok)
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Degraded => write!(f, "degraded"),
            ModuleStatus::Error => write!(f, "error"),
        }
    }
}

/// Scalar value in a report's details map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Null => write!(f, "-"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v:.2}"),
            Scalar::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        i64::try_from(v).map(Scalar::Int).unwrap_or(Scalar::Float(v as f64))
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        Scalar::from(v as u64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// Health or stats snapshot of one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub module: String,
    pub status: ModuleStatus,
    #[serde(default)]
    pub details: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub type ModuleHealthReport = ModuleReport;
pub type ModuleStatsReport = ModuleReport;

impl ModuleReport {
    pub fn new(module: &str, status: ModuleStatus) -> Self {
        Self {
            module: module.to_string(),
            status,
            details: BTreeMap::new(),
            error_message: None,
        }
    }

    pub fn ok(module: &str) -> Self {
        Self::new(module, ModuleStatus::Ok)
    }

    pub fn degraded(module: &str) -> Self {
        Self::new(module, ModuleStatus::Degraded)
    }

    pub fn error(module: &str, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::new(module, ModuleStatus::Error)
        }
    }

    /// Add one detail entry
    pub fn with(mut self, key: &str, value: impl Into<Scalar>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Raise the status to `status` if it is more severe than the current one
    pub fn escalate(mut self, status: ModuleStatus) -> Self {
        self.status = self.status.max(status);
        self
    }
}

/// Contract every feature module implements for the diagnostics aggregator.
///
/// Both checks must finish quickly and must not panic: a failing internal check is
/// reported as [`ModuleStatus::Error`] with `error_message` set. The aggregator still
/// isolates panics and enforces a timeout, but a module relying on that is a bug.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    async fn health(&self) -> ModuleHealthReport;

    async fn stats(&self) -> ModuleStatsReport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_severity_order() {
        assert!(ModuleStatus::Ok < ModuleStatus::Degraded);
        assert!(ModuleStatus::Degraded < ModuleStatus::Error);
    }

    #[test]
    fn test_escalate_never_lowers() {
        let report = ModuleReport::degraded("oil").escalate(ModuleStatus::Ok);
        assert_eq!(report.status, ModuleStatus::Degraded);
        let report = report.escalate(ModuleStatus::Error);
        assert_eq!(report.status, ModuleStatus::Error);
    }

    #[test]
    fn test_report_serializes_flat_details() {
        let report = ModuleReport::ok("oil")
            .with("polls", 12u64)
            .with("last_hash", Some("ab12cd34"))
            .with("last_error", None::<String>);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["details"]["polls"], 12);
        assert_eq!(json["details"]["last_hash"], "ab12cd34");
        assert!(json["details"]["last_error"].is_null());
        assert!(json.get("error_message").is_none());
    }
}
