//! Application wiring
//!
//! One [`Application`] is one supervised run: a fresh circuit breaker, clients, and
//! module registry. Only the crash handler is shared across runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::clients::{ChatPlatform, DiscordRest, GuardedHttpClient, GuardedPlatformClient};
use crate::config::AppConfig;
use crate::diagnostics::{DiagnosticsAggregator, DiagnosticsServer, DiagnosticsState, HealthReporter};
use crate::error::{panic_message, BotError, Result};
use crate::modules::{CircuitsModule, EndpointPoller, OpsModule};
use crate::resilience::CircuitBreaker;
use crate::supervisor::{CrashHandler, PlatformAlertSink, ShutdownSignal, WebhookAlertSink};

/// Discord client from `platform.token`, if configured
pub fn platform_from_config(config: &AppConfig) -> Result<Option<Arc<dyn ChatPlatform>>> {
    let Some(token) = config.platform.token.as_deref() else {
        return Ok(None);
    };
    let discord = DiscordRest::new(
        &config.platform.api_base,
        token,
        Duration::from_secs(config.http.request_timeout_secs),
    )?;
    Ok(Some(Arc::new(discord)))
}

/// Crash handler with every configured alert sink attached
pub fn build_crash_handler(
    config: &AppConfig,
    platform: Option<Arc<dyn ChatPlatform>>,
) -> Result<CrashHandler> {
    let mut handler = CrashHandler::new(config.supervisor.clone());
    match (config.supervisor.emergency_channel_id, platform) {
        (Some(channel_id), Some(platform)) => {
            let client = GuardedPlatformClient::new(platform, config.platform_retry.clone());
            handler = handler.with_sink(Arc::new(PlatformAlertSink::new(client, channel_id)));
        }
        (Some(_), None) => warn!("Emergency channel configured without a platform token, chat alerts disabled"),
        _ => {}
    }
    if let Some(url) = &config.supervisor.alert_webhook_url {
        let timeout = Duration::from_secs(config.supervisor.alert_timeout_secs);
        handler = handler.with_sink(Arc::new(WebhookAlertSink::new(url, timeout)?));
    }
    Ok(handler)
}

pub struct Application {
    config: AppConfig,
    crash_handler: Arc<CrashHandler>,
    breaker: Arc<CircuitBreaker>,
    platform: Option<GuardedPlatformClient>,
    aggregator: Arc<DiagnosticsAggregator>,
    poller: Option<Arc<EndpointPoller>>,
}

impl Application {
    pub fn build(config: AppConfig, crash_handler: Arc<CrashHandler>) -> Result<Self> {
        let platform = platform_from_config(&config)?;
        Self::build_with_platform(config, crash_handler, platform)
    }

    /// Build around an explicit platform implementation
    pub fn build_with_platform(
        config: AppConfig,
        crash_handler: Arc<CrashHandler>,
        platform: Option<Arc<dyn ChatPlatform>>,
    ) -> Result<Self> {
        config.ensure_valid()?;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let http = Arc::new(GuardedHttpClient::new(
            Arc::clone(&breaker),
            config.http_retry.clone(),
            &config.http,
        )?);
        let platform = platform.map(|p| {
            GuardedPlatformClient::new(p, config.platform_retry.clone())
                .with_breaker(Arc::clone(&breaker))
        });

        let poller = if config.poller.enabled {
            let mut poller = EndpointPoller::new(config.poller.clone(), Arc::clone(&http))?;
            if let (Some(platform), Some(channel_id)) = (&platform, config.platform.notify_channel_id) {
                poller = poller.with_notifier(platform.clone(), channel_id);
            }
            Some(Arc::new(poller))
        } else {
            None
        };

        let mut aggregator = DiagnosticsAggregator::new(config.diagnostics.module_timeout());
        aggregator.register(Arc::new(OpsModule::new(Arc::clone(&crash_handler))));
        aggregator.register(Arc::new(CircuitsModule::new(Arc::clone(&breaker))));
        if let Some(poller) = &poller {
            aggregator.register(Arc::clone(poller) as Arc<dyn HealthReporter>);
        }

        Ok(Self {
            config,
            crash_handler,
            breaker,
            platform,
            aggregator: Arc::new(aggregator),
            poller,
        })
    }

    pub fn aggregator(&self) -> &Arc<DiagnosticsAggregator> {
        &self.aggregator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run until `shutdown` fires or a background task fails
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<()> {
        if let Some(platform) = &self.platform {
            platform.verify().await?;
            info!(platform = platform.platform_name(), "Platform credentials verified");
        }

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        if let Some(poller) = &self.poller {
            tasks.spawn(Arc::clone(poller).run(shutdown.clone()));
        }
        if let Some(port) = self.config.diagnostics.port {
            let state = Arc::new(DiagnosticsState::new(
                Arc::clone(&self.aggregator),
                Arc::clone(&self.crash_handler),
            ));
            let server =
                DiagnosticsServer::bind(state, &self.config.diagnostics.bind_address, port)?;
            tasks.spawn(server.run(shutdown.clone()));
        }
        info!(
            modules = ?self.aggregator.module_names(),
            background_tasks = tasks.len(),
            "Application running"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                joined = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Background task failed");
                        tasks.shutdown().await;
                        return Err(e);
                    }
                    Some(Err(e)) if e.is_panic() => {
                        let message = panic_message(e.into_panic().as_ref());
                        tasks.shutdown().await;
                        return Err(BotError::Internal(format!("background task panicked: {message}")));
                    }
                    Some(Err(_)) | None => {}
                },
            }
        }

        // Tasks watch the same signal; give them a moment to finish cleanly.
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("Background tasks did not stop in time, aborting");
            tasks.shutdown().await;
        }
        info!("Application stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::platform::testing::ScriptedPlatform;
    use crate::diagnostics::ModuleStatus;

    #[test]
    fn test_builds_default_modules() {
        let app = Application::build(AppConfig::default(), Arc::new(CrashHandler::with_defaults()))
            .unwrap();
        assert_eq!(app.aggregator().module_names(), vec!["ops", "circuits"]);
    }

    #[test]
    fn test_invalid_config_is_non_retryable() {
        let mut config = AppConfig::default();
        config.poller.enabled = true;
        let err = Application::build(config, Arc::new(CrashHandler::with_defaults()))
            .err()
            .unwrap();
        assert!(err.is_non_retryable());
    }

    #[tokio::test]
    async fn test_rejected_credentials_stop_startup() {
        let platform = Arc::new(ScriptedPlatform::new(vec![Err(BotError::Auth(
            "401".into(),
        ))]));
        let app = Application::build_with_platform(
            AppConfig::default(),
            Arc::new(CrashHandler::with_defaults()),
            Some(platform as Arc<dyn ChatPlatform>),
        )
        .unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let err = app.run(ShutdownSignal::new(rx)).await.unwrap_err();

        assert_eq!(err.kind_label(), "auth");
        assert!(err.is_non_retryable());
    }

    #[tokio::test]
    async fn test_fresh_run_reports_ok() {
        let app = Application::build(AppConfig::default(), Arc::new(CrashHandler::with_defaults()))
            .unwrap();
        let report = app.aggregator().aggregate().await;
        assert_eq!(report.overall, ModuleStatus::Ok);
    }
}
