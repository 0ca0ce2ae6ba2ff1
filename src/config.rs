//! Downloader configuration from `MARKETCAP_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::downloader::DownloaderConfig;
use crate::history::DateZone;

pub const VENDOR_NAME: &str = "coingecko";
pub const VENDOR_DATA_NAME: &str = "marketcap";
pub const REFERENCE_TABLE_RELATIVE: &str = "symbol-properties/symbol-properties-database.csv";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Starts from [`DownloaderConfig::default`] and applies every variable that
/// is set and non-empty. Numeric values that do not parse are rejected.
pub fn downloader_config_from_env() -> Result<DownloaderConfig, ConfigError> {
    let mut config = DownloaderConfig::default();

    if let Some(data_folder) = env_value("MARKETCAP_DATA_FOLDER") {
        config.reference_table = PathBuf::from(data_folder).join(REFERENCE_TABLE_RELATIVE);
    }
    if let Some(destination) = env_value("MARKETCAP_DESTINATION") {
        config.destination = PathBuf::from(destination)
            .join("alternative")
            .join(VENDOR_NAME)
            .join(VENDOR_DATA_NAME);
    }
    if let Some(base_url) = env_value("MARKETCAP_API_BASE_URL") {
        config.api_base_url = base_url;
    }
    if let Some(rate) = parse_env::<f64>("MARKETCAP_RATE_LIMIT")? {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                var: "MARKETCAP_RATE_LIMIT",
                value: rate.to_string(),
            });
        }
        config.rate_limit_per_sec = rate;
    }
    if let Some(max_attempts) = parse_env::<u32>("MARKETCAP_MAX_ATTEMPTS")? {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(backoff_ms) = parse_env::<u64>("MARKETCAP_RETRY_BACKOFF_MS")? {
        config.retry.backoff_ms = backoff_ms;
    }
    if let Some(timeout_ms) = parse_env::<u64>("MARKETCAP_HTTP_TIMEOUT_MS")? {
        config.http_timeout_ms = timeout_ms;
    }
    if let Some(workers) = parse_env::<usize>("MARKETCAP_WORKERS")? {
        config.workers = workers.max(1);
    }
    if let Some(zone) = env_value("MARKETCAP_DATE_ZONE") {
        config.date_zone = parse_date_zone(&zone).ok_or(ConfigError::InvalidValue {
            var: "MARKETCAP_DATE_ZONE",
            value: zone,
        })?;
    }

    Ok(config)
}

fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    env_value(var)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { var, value: raw })
        })
        .transpose()
}

fn parse_date_zone(raw: &str) -> Option<DateZone> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "utc" => Some(DateZone::Utc),
        "local" => Some(DateZone::Local),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::{Mutex, OnceLock};

    const ALL_VARS: [&str; 9] = [
        "MARKETCAP_DATA_FOLDER",
        "MARKETCAP_DESTINATION",
        "MARKETCAP_API_BASE_URL",
        "MARKETCAP_RATE_LIMIT",
        "MARKETCAP_MAX_ATTEMPTS",
        "MARKETCAP_RETRY_BACKOFF_MS",
        "MARKETCAP_HTTP_TIMEOUT_MS",
        "MARKETCAP_WORKERS",
        "MARKETCAP_DATE_ZONE",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_vars<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(&str, Option<String>)> =
            ALL_VARS.iter().map(|key| (*key, env::var(key).ok())).collect();

        for key in ALL_VARS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&[], downloader_config_from_env).unwrap();
        assert_eq!(cfg, DownloaderConfig::default());
    }

    #[test]
    fn folders_and_tuning_come_from_env() {
        let cfg = with_env_vars(
            &[
                ("MARKETCAP_DATA_FOLDER", "/lean/data"),
                ("MARKETCAP_DESTINATION", "/tmp/out"),
                ("MARKETCAP_RATE_LIMIT", "0.5"),
                ("MARKETCAP_MAX_ATTEMPTS", "3"),
                ("MARKETCAP_RETRY_BACKOFF_MS", "10"),
                ("MARKETCAP_WORKERS", "0"),
                ("MARKETCAP_DATE_ZONE", "Local"),
            ],
            downloader_config_from_env,
        )
        .unwrap();

        assert_eq!(
            cfg.reference_table,
            Path::new("/lean/data/symbol-properties/symbol-properties-database.csv")
        );
        assert_eq!(
            cfg.destination,
            Path::new("/tmp/out/alternative/coingecko/marketcap")
        );
        assert_eq!(cfg.rate_limit_per_sec, 0.5);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.backoff_ms, 10);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.date_zone, DateZone::Local);
    }

    #[test]
    fn unparseable_numbers_are_rejected() {
        let err = with_env_vars(
            &[("MARKETCAP_MAX_ATTEMPTS", "five")],
            downloader_config_from_env,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                var: "MARKETCAP_MAX_ATTEMPTS",
                value: "five".to_string()
            }
        );

        let err = with_env_vars(&[("MARKETCAP_RATE_LIMIT", "-1")], downloader_config_from_env)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "MARKETCAP_RATE_LIMIT",
                ..
            }
        ));
    }

    #[test]
    fn zero_or_infinite_rate_limit_is_rejected() {
        for raw in ["0", "0.0", "inf", "NaN"] {
            let err = with_env_vars(&[("MARKETCAP_RATE_LIMIT", raw)], downloader_config_from_env)
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    ConfigError::InvalidValue {
                        var: "MARKETCAP_RATE_LIMIT",
                        ..
                    }
                ),
                "rate {raw} should be rejected"
            );
        }

        let cfg = with_env_vars(
            &[("MARKETCAP_RATE_LIMIT", "0.0001")],
            downloader_config_from_env,
        )
        .unwrap();
        assert_eq!(cfg.rate_limit_per_sec, 0.0001);
    }
}
