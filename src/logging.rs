//! Tracing subscriber setup

use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber: console output plus an optional daily log file.
///
/// `RUST_LOG` wins over `logging.level`. Calling this twice is harmless; the second
/// call leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let file_layer = config.dir.as_deref().and_then(|dir| {
        // `rolling::daily` panics if it cannot create the first file, so check first.
        if let Err(e) = ensure_writable(Path::new(dir)) {
            eprintln!("Warning: could not write to log directory {dir} ({e}), file logging disabled");
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, "oilwatch.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The process logs until exit; the guard must outlive every log call.
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let file_logging = file_layer.is_some();
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed && file_logging {
        if let Some(dir) = &config.dir {
            eprintln!("Logging to: {dir}/oilwatch.log");
        }
    }
}

fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".oilwatch_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    std::fs::remove_file(&probe)
}

/// Minimal warn-level logging for one-shot commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_writable_creates_directory() {
        let dir = std::env::temp_dir().join(format!("oilwatch-logs-{}", uuid::Uuid::new_v4()));
        ensure_writable(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join(".oilwatch_write_test").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
