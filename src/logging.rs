//! # Structured Logging Module
//!
//! Environment-aware `tracing` setup and uniform operation records for runs
//! and jobs.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::models::Stage;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// `RUST_LOG` wins over the configured level, which wins over the
/// environment default.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let default_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

        let layer = match config.format {
            LogFormat::Console => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(filter)
                .boxed(),
        };

        // A subscriber may already be installed by an embedding process
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("ORCHESTRATOR_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for run operations
pub fn log_run_operation(operation: &str, run_id: i64, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        run_id = run_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 RUN_OPERATION"
    );
}

/// Log structured data for job operations
pub fn log_job_operation(
    operation: &str,
    stage: Stage,
    run_id: i64,
    job_id: i64,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        stage = %stage,
        run_id = run_id,
        job_id = job_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 JOB_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_per_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_initialization_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
        log_run_operation("create", 1, "CREATED", None);
    }
}
