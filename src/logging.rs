//! Logging setup — grounded on `original_source/.../runtime/logging_utils.py`, ported
//! from Python `logging` handlers to `tracing` layers: a stdout layer always present,
//! plus an optional file layer, both honoring the same plain/json format switch.

use crate::config::{Config, LogFormat};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the non-blocking file writer's worker thread alive for the process lifetime.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

pub fn setup(config: &Config, component: &str) -> LoggingGuard {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = match config.log_format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Plain => fmt::layer().with_target(true).boxed(),
    };

    let (file_layer, guard) = match &config.log_file {
        Some(file_name) if !matches!(file_name.to_lowercase().as_str(), "none" | "stdout" | "stderr") => {
            let dir = config.log_dir.clone().unwrap_or_else(|| config.data_dir.clone());
            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = match config.log_format {
                LogFormat::Json => fmt::layer().json().with_writer(non_blocking).boxed(),
                LogFormat::Plain => fmt::layer().with_writer(non_blocking).boxed(),
            };
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer);

    // Re-initializing a global subscriber across tests is an error we can ignore.
    let _ = registry.try_init();

    tracing::info!(component, "logging initialized");
    LoggingGuard(guard)
}
