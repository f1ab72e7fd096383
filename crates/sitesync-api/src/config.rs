use std::collections::HashMap;
use std::env;
use std::fmt;

use sitesync_core::config::{ConfigError, SyncConfig};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub sync: SyncConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("sync", &self.sync)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("SYNC_BIND_ADDR")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        if !bind_addr.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "SYNC_BIND_ADDR must be host:port, got '{bind_addr}'"
            )));
        }

        Ok(Self {
            bind_addr,
            sync: SyncConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_map() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SYNC_REMOTE_URL", "https://central.school.cm"),
            ("SYNC_API_KEY", "sensitive-shared-secret"),
            ("SYNC_SERVER_ID", "site-bafoussam"),
        ])
    }

    #[test]
    fn config_requires_sync_settings() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SYNC_REMOTE_URL"));
    }

    #[test]
    fn config_defaults_bind_addr_and_redacts_key() {
        let map = base_map();
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8090");
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-shared-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn config_rejects_bind_addr_without_port() {
        let mut map = base_map();
        map.insert("SYNC_BIND_ADDR", "localhost");
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SYNC_BIND_ADDR"));
    }
}
