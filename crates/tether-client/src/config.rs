use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_protocol::DEFAULT_ENDPOINT;

pub const ENDPOINT_ENV: &str = "TETHER_ENDPOINT";
pub const TOKEN_ENV: &str = "TETHER_TOKEN";

/// Client settings. Every field has a default so a missing or partial
/// `config.toml` is valid.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub message_load_retry_ms: u64,
    pub activity_debounce_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub max_version_retries: u32,
    pub file_index_ttl_ms: u64,
    pub state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 5_000,
            message_load_retry_ms: 1_000,
            activity_debounce_ms: 2_000,
            disconnect_timeout_ms: 120_000,
            max_version_retries: 5,
            file_index_ttl_ms: 30_000,
            state_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load from the default location, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env();
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV)
            && !endpoint.is_empty()
        {
            self.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            self.token = Some(token);
        }
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Where the passphrase-encrypted master secret lives.
    pub fn secret_path(&self) -> PathBuf {
        self.state_dir().join("secret.json")
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn message_load_retry(&self) -> Duration {
        Duration::from_millis(self.message_load_retry_ms)
    }

    pub fn activity_debounce(&self) -> Duration {
        Duration::from_millis(self.activity_debounce_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn file_index_ttl(&self) -> Duration {
        Duration::from_millis(self.file_index_ttl_ms)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("tether")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("tether")
    } else {
        PathBuf::from("/tmp/tether")
    }
}

fn default_state_dir() -> PathBuf {
    if let Ok(data_dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("tether")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("tether")
    } else {
        PathBuf::from("/tmp/tether")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.activity_debounce(), Duration::from_secs(2));
        assert_eq!(config.reconnect_max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "endpoint = \"http://127.0.0.1:3005\"\nmax_version_retries = 2\nstate_dir = \"/var/lib/tether\"\n",
        )
        .unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.endpoint, "http://127.0.0.1:3005");
        assert_eq!(config.max_version_retries, 2);
        assert_eq!(config.disconnect_timeout_ms, 120_000);
        assert_eq!(
            config.secret_path(),
            PathBuf::from("/var/lib/tether/secret.json")
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "endpoint = [").unwrap();
        assert!(ClientConfig::load_from(&path).is_err());
    }
}
