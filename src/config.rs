use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::clients::{HttpConfig, PlatformConfig};
use crate::error::{BotError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::supervisor::SupervisorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Retry policy for upstream HTTP calls
    #[serde(default)]
    pub http_retry: RetryPolicy,
    /// Retry policy for chat platform calls
    #[serde(default = "default_platform_retry")]
    pub platform_retry: RetryPolicy,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_platform_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        jitter: true,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// Per-module bound on a health or stats check
    #[serde(default = "default_module_timeout_ms")]
    pub module_timeout_ms: u64,
    /// Port for the diagnostics HTTP server; disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_module_timeout_ms() -> u64 {
    2_000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            module_timeout_ms: default_module_timeout_ms(),
            port: None,
            bind_address: default_bind_address(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn module_timeout(&self) -> Duration {
        Duration::from_millis(self.module_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint to watch for content changes
    #[serde(default)]
    pub url: Option<String>,
    /// Circuit name for the endpoint
    #[serde(default = "default_poller_resource")]
    pub resource: String,
    /// Seconds between polls while content keeps changing
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    /// Interval multiplier once content has been stable for a while
    #[serde(default = "default_relaxed_multiplier")]
    pub relaxed_multiplier: u32,
    /// Unchanged polls before switching to the relaxed interval
    #[serde(default = "default_unchanged_before_relax")]
    pub unchanged_before_relax: u32,
}

fn default_poller_resource() -> String {
    "oil-api".to_string()
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_relaxed_multiplier() -> u32 {
    3
}

fn default_unchanged_before_relax() -> u32 {
    3
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            resource: default_poller_resource(),
            interval_secs: default_poll_interval_secs(),
            relaxed_multiplier: default_relaxed_multiplier(),
            unchanged_before_relax: default_unchanged_before_relax(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info,oilwatch=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.json", false)?
            .set_default("diagnostics.module_timeout_ms", 2_000)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("OILWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (OILWATCH_PLATFORM__TOKEN, etc.)
            .add_source(
                Environment::with_prefix("OILWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Every configuration problem, empty when the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.circuit_breaker.failure_threshold == 0 {
            problems.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.open_seconds == 0 {
            problems.push("circuit_breaker.open_seconds must be at least 1".to_string());
        }
        for (name, policy) in [
            ("http_retry", &self.http_retry),
            ("platform_retry", &self.platform_retry),
        ] {
            if policy.max_attempts == 0 {
                problems.push(format!("{name}.max_attempts must be at least 1"));
            }
            if policy.base_delay_ms > policy.max_delay_ms {
                problems.push(format!("{name}.base_delay_ms exceeds {name}.max_delay_ms"));
            }
        }
        if self.supervisor.restart_delay_base_secs > self.supervisor.restart_delay_max_secs {
            problems.push(
                "supervisor.restart_delay_base_secs exceeds supervisor.restart_delay_max_secs"
                    .to_string(),
            );
        }
        if self.supervisor.emergency_channel_id.is_some() && self.platform.token.is_none() {
            problems.push("supervisor.emergency_channel_id requires platform.token".to_string());
        }
        if let Some(url) = &self.supervisor.alert_webhook_url {
            if url::Url::parse(url).is_err() {
                problems.push(format!("supervisor.alert_webhook_url is not a valid URL: {url}"));
            }
        }
        if self.diagnostics.module_timeout_ms == 0 {
            problems.push("diagnostics.module_timeout_ms must be at least 1".to_string());
        }
        if self.platform.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            problems.push("platform.token is set but empty".to_string());
        }
        if self.poller.enabled {
            match &self.poller.url {
                None => problems.push("poller.url is required when poller.enabled".to_string()),
                Some(url) if url::Url::parse(url).is_err() => {
                    problems.push(format!("poller.url is not a valid URL: {url}"))
                }
                Some(_) => {}
            }
            if self.poller.interval_secs == 0 {
                problems.push("poller.interval_secs must be at least 1".to_string());
            }
            if self.poller.relaxed_multiplier == 0 {
                problems.push("poller.relaxed_multiplier must be at least 1".to_string());
            }
        }

        problems
    }

    /// [`validate`](Self::validate) as a single error
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BotError::InvalidConfig(problems.join("; ")))
        }
    }
}
