use clap::Parser;
use oilwatch::app::{build_crash_handler, platform_from_config, Application};
use oilwatch::cli::{self, Cli, Commands};
use oilwatch::config::AppConfig;
use oilwatch::error::Result;
use oilwatch::logging::{init_logging, init_logging_simple};
use oilwatch::supervisor::{ShutdownSignal, Supervisor, EXIT_NON_RETRYABLE};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {}", e);
            eprintln!("Error: {e}");
            if e.is_non_retryable() {
                EXIT_NON_RETRYABLE
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command() {
        Commands::CheckConfig => {
            init_logging_simple();
            let config = AppConfig::load_from(&cli.config_dir)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration OK ({})", cli.config_dir.display());
                return Ok(0);
            }
            for problem in &problems {
                println!("  - {problem}");
            }
            Ok(EXIT_NON_RETRYABLE)
        }
        Commands::Run { unsupervised } => {
            let config = AppConfig::load_from(&cli.config_dir)?;
            init_logging(&config.logging);
            config.ensure_valid()?;

            let alert_platform = platform_from_config(&config)?;
            let crash_handler = Arc::new(build_crash_handler(&config, alert_platform)?);
            let env_value = std::env::var("RUN_SUPERVISED").ok();

            if !cli::run_supervised(unsupervised, env_value.as_deref()) {
                info!("Running without supervision");
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    shutdown_signal().await;
                    info!("Received shutdown signal");
                    tx.send_replace(true);
                });
                Application::build(config, crash_handler)?
                    .run(ShutdownSignal::new(rx))
                    .await?;
                return Ok(0);
            }

            let supervisor = Supervisor::new(Arc::clone(&crash_handler));
            let stop = supervisor.stop_handle();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Received shutdown signal");
                stop.stop();
            });

            let outcome = supervisor
                .run(move |ctx| {
                    let config = config.clone();
                    let crash_handler = Arc::clone(&crash_handler);
                    async move {
                        info!(run = ctx.run_number, "Building application");
                        Application::build(config, crash_handler)?
                            .run(ctx.shutdown)
                            .await
                    }
                })
                .await;

            Ok(outcome.exit_code())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
