//! Shared logging configuration and initialization.

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::coingecko::DaysWindow;
use crate::downloader::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `MARKETCAP_LOG_LEVEL`, `MARKETCAP_LOG_FORMAT` and `MARKETCAP_LOG_TARGET`.
/// Unrecognized values keep the defaults.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    let read = |var: &str| {
        env::var(var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    LoggingConfig {
        level: read("MARKETCAP_LOG_LEVEL").unwrap_or(defaults.level),
        format: read("MARKETCAP_LOG_FORMAT")
            .and_then(|raw| parse_log_format(&raw))
            .unwrap_or(defaults.format),
        include_target: read("MARKETCAP_LOG_TARGET")
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig, window: DaysWindow) {
    info!(
        component = "marketcap_sync",
        event = "app.start",
        window = ?window,
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

/// Whole minutes, rounded down, as reported at exit.
pub fn elapsed_minutes(elapsed: Duration) -> u64 {
    elapsed.as_secs() / 60
}

pub fn log_app_exit(summary: Option<&RunSummary>, elapsed: Duration) {
    let minutes = elapsed_minutes(elapsed);
    match summary {
        Some(summary) if summary.is_success() => info!(
            component = "marketcap_sync",
            event = "app.exit",
            succeeded = summary.succeeded,
            elapsed_minutes = minutes
        ),
        Some(summary) => warn!(
            component = "marketcap_sync",
            event = "app.exit",
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            not_attempted = summary.not_attempted,
            failed_coin_ids = ?summary.failed_coin_ids(),
            elapsed_minutes = minutes
        ),
        None => warn!(
            component = "marketcap_sync",
            event = "app.exit",
            aborted = true,
            elapsed_minutes = minutes
        ),
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
