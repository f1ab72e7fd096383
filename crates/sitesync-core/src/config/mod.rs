//! Runtime configuration for a sync node.
//!
//! Every value comes from `SYNC_*` environment variables. Parsing goes
//! through [`SyncConfig::from_lookup`] so tests can pass a map instead of
//! touching the process environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::ResolutionPolicy;
use crate::resolver::PolicyBook;
use crate::util::{is_http_url, normalize_text_option};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct SyncConfig {
    pub remote_url: String,
    pub api_key: String,
    pub server_id: String,
    pub database_path: PathBuf,
    pub interval_minutes: u64,
    pub auto_sync_enabled: bool,
    pub request_timeout: Duration,
    pub batch_size: usize,
    pub connectivity_cache: Duration,
    pub monitor_interval: Duration,
    pub log_retention: usize,
    pub policies: PolicyBook,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("api_key", &"[REDACTED]")
            .field("server_id", &self.server_id)
            .field("database_path", &self.database_path)
            .field("interval_minutes", &self.interval_minutes)
            .field("auto_sync_enabled", &self.auto_sync_enabled)
            .field("request_timeout", &self.request_timeout)
            .field("batch_size", &self.batch_size)
            .field("connectivity_cache", &self.connectivity_cache)
            .field("monitor_interval", &self.monitor_interval)
            .field("log_retention", &self.log_retention)
            .field("policies", &self.policies)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let remote_url = required_trimmed(&lookup, "SYNC_REMOTE_URL")?
            .trim_end_matches('/')
            .to_string();
        if !is_http_url(&remote_url) {
            return Err(ConfigError::Invalid(
                "SYNC_REMOTE_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_key = required_trimmed(&lookup, "SYNC_API_KEY")?;
        let server_id = required_trimmed(&lookup, "SYNC_SERVER_ID")?;

        let database_path =
            PathBuf::from(value_or_default(&lookup, "SYNC_DATABASE_PATH", "sitesync.db"));

        let interval_minutes = bounded(&lookup, "SYNC_INTERVAL_MINUTES", 15, 1, 1_440)?;
        let auto_sync_enabled = flag(&lookup, "SYNC_AUTO_ENABLED", true)?;
        let request_timeout_secs = bounded(&lookup, "SYNC_REQUEST_TIMEOUT_SECS", 30, 1, 300)?;
        let batch_size = bounded(&lookup, "SYNC_BATCH_SIZE", 100, 1, 1_000)?;
        let connectivity_cache_secs =
            bounded(&lookup, "SYNC_CONNECTIVITY_CACHE_SECS", 30, 0, 3_600)?;
        let monitor_interval_secs = bounded(&lookup, "SYNC_MONITOR_INTERVAL_SECS", 60, 1, 3_600)?;
        let log_retention = bounded(&lookup, "SYNC_LOG_RETENTION", 500, 1, 100_000)?;

        let policies = match optional_trimmed(&lookup, "SYNC_CONFLICT_POLICIES") {
            Some(overrides) => PolicyBook::new(ResolutionPolicy::TimestampWins)
                .with_overrides(&overrides)
                .map_err(|error| {
                    ConfigError::Invalid(format!("SYNC_CONFLICT_POLICIES: {error}"))
                })?,
            None => PolicyBook::new(ResolutionPolicy::TimestampWins),
        };

        Ok(Self {
            remote_url,
            api_key,
            server_id,
            database_path,
            interval_minutes,
            auto_sync_enabled,
            request_timeout: Duration::from_secs(request_timeout_secs),
            batch_size: usize::try_from(batch_size).unwrap_or(100),
            connectivity_cache: Duration::from_secs(connectivity_cache_secs),
            monitor_interval: Duration::from_secs(monitor_interval_secs),
            log_retention: usize::try_from(log_retention).unwrap_or(500),
            policies,
        })
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn flag(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SYNC_REMOTE_URL", "https://central.school.cm/"),
            ("SYNC_API_KEY", "sensitive-shared-secret"),
            ("SYNC_SERVER_ID", "site-bafoussam"),
        ])
    }

    fn load(map: &HashMap<&str, &str>) -> Result<SyncConfig, ConfigError> {
        SyncConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_remote_and_identity() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("SYNC_REMOTE_URL"));

        let mut map = base();
        map.remove("SYNC_SERVER_ID");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("SYNC_SERVER_ID"));
    }

    #[test]
    fn config_applies_defaults() {
        let config = load(&base()).unwrap();
        assert_eq!(config.remote_url, "https://central.school.cm");
        assert_eq!(config.database_path, PathBuf::from("sitesync.db"));
        assert_eq!(config.interval_minutes, 15);
        assert!(config.auto_sync_enabled);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.connectivity_cache, Duration::from_secs(30));
        assert_eq!(config.log_retention, 500);
        assert_eq!(
            config.policies.policy_for("marks", "score"),
            ResolutionPolicy::TimestampWins
        );
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let mut map = base();
        map.insert("SYNC_INTERVAL_MINUTES", "0");
        assert!(load(&map).is_err());

        let mut map = base();
        map.insert("SYNC_BATCH_SIZE", "lots");
        assert!(load(&map).is_err());

        let mut map = base();
        map.insert("SYNC_AUTO_ENABLED", "maybe");
        assert!(load(&map).is_err());

        let mut map = base();
        map.insert("SYNC_REMOTE_URL", "central.school.cm");
        assert!(load(&map).is_err());
    }

    #[test]
    fn config_reads_policy_overrides() {
        let mut map = base();
        map.insert("SYNC_CONFLICT_POLICIES", "users.status=MANUAL");
        map.insert("SYNC_AUTO_ENABLED", "off");
        let config = load(&map).unwrap();
        assert!(!config.auto_sync_enabled);
        assert_eq!(
            config.policies.policy_for("users", "status"),
            ResolutionPolicy::Manual
        );

        map.insert("SYNC_CONFLICT_POLICIES", "users.status=SOMETIMES");
        assert!(load(&map).is_err());
    }

    #[test]
    fn config_redacts_api_key() {
        let config = load(&base()).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-shared-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
