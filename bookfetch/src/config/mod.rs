//! Process configuration and settings keys.
//!
//! Process-level options come from the environment (a `.env` file is loaded
//! through `dotenvy` first). Everything the user edits at runtime lives in
//! the `settings` table under the keys declared here.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// JSON array of download client configurations.
pub const DOWNLOAD_CLIENTS_KEY: &str = "download_clients";

/// Base directory downloads land in.
pub const DOWNLOAD_DIR_KEY: &str = "download_dir";

/// Used when `download_dir` is unset.
pub const DEFAULT_DOWNLOAD_DIR: &str = "/downloads";

/// Flat keys of the single-client configuration that predates `download_clients`.
pub mod legacy {
    pub const TYPE: &str = "download_client_type";
    pub const URL: &str = "download_client_url";
    pub const USERNAME: &str = "download_client_username";
    pub const PASSWORD: &str = "download_client_password";
    pub const DISABLE_SSL_VERIFY: &str = "download_client_disable_ssl_verify";
    pub const REMOTE_PATH_MAPPING_ENABLED: &str = "download_client_remote_path_mapping_enabled";
    pub const REMOTE_PATH: &str = "download_client_remote_path";
    pub const LOCAL_PATH: &str = "download_client_local_path";
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// Concurrent job executions.
    pub worker_concurrency: usize,
    /// A job running longer than this fails.
    pub job_timeout: Duration,
    /// Attempts per job before it is marked failed.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Delay between monitor polls of an active download.
    pub monitor_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:bookfetch.db?mode=rwc".to_string(),
            log_dir: "logs".to_string(),
            worker_concurrency: 3,
            job_timeout: Duration::from_secs(30 * 60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir: lookup("LOG_DIR").unwrap_or(defaults.log_dir),
            worker_concurrency: parse_var(&lookup, "WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker_concurrency),
            job_timeout: parse_var(&lookup, "JOB_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            max_attempts: parse_var(&lookup, "JOB_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff_base: parse_var(&lookup, "JOB_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_base),
            monitor_interval: parse_var(&lookup, "MONITOR_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_interval),
        };

        if config.worker_concurrency == 0 {
            return Err(Error::config("WORKER_CONCURRENCY must be at least 1"));
        }
        if config.max_attempts == 0 {
            return Err(Error::config("JOB_MAX_ATTEMPTS must be at least 1"));
        }
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("{key}: invalid value '{raw}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("WORKER_CONCURRENCY", "8"),
            ("JOB_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.job_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values() {
        assert!(AppConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "many")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("JOB_MAX_ATTEMPTS", "0")])).is_err());
    }
}
