//! Unified error taxonomy for the collection engine.
//!
//! Mirrors the kinds called out in the design (config / external-service / data /
//! io), each carrying a stable `code()` so the one-line log summary at a call's outer
//! boundary can report a machine-greppable reason without formatting the whole chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatacatError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("data validation error: {0}")]
    DataValidation(String),

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DatacatError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalService(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::DataValidation(msg.into())
    }

    /// Stable code used in the structured log line, matching the taxonomy in spec §7.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::ExternalService(_) => "external_service_error",
            Self::DataValidation(_) => "data_validation_error",
            Self::Io(_) => "io_error",
            Self::Store(_) => "store_error",
            Self::Pool(_) => "pool_error",
            Self::Http(_) => "http_error",
            Self::Other(_) => "unknown_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DatacatError>;

/// Runs `main_func`, logs a structured line on failure, and maps the outcome to the
/// process exit code contract in spec §6.2 (0 success, 1 unhandled error, 130 SIGINT).
pub fn safe_main(component: &str, main_func: impl FnOnce() -> Result<()>) -> i32 {
    match main_func() {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(
                component,
                error_code = err.code(),
                error = %err,
                "run failed"
            );
            1
        }
    }
}
