use crate::error::ConfigError;
use crate::reconnect::ReconnectPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default relay address used when no config file is present.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Fixed delay between reconnect attempts and between failed refreshes.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 3_000;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the request/response API.
    pub api_url: String,
    /// Push channel endpoint. Derived from `api_url` when unset.
    pub push_url: Option<String>,
    pub reconnect_delay_ms: u64,
    /// Stop reconnecting after this many consecutive failures. Unset retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub refresh_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl ClientConfig {
    /// Load from `$RELAYCHAT_CONFIG` or the user config dir, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn config_path() -> PathBuf {
        if let Ok(p) = std::env::var("RELAYCHAT_CONFIG") {
            return PathBuf::from(p);
        }
        dirs_path().join("config.toml")
    }

    /// Config pointing at a relay on `api_url` with every other field defaulted.
    pub fn for_relay(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// WebSocket endpoint of the push channel, without the `user_id` query.
    pub fn push_endpoint(&self) -> String {
        if let Some(url) = &self.push_url {
            return url.clone();
        }
        let base = self.api_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/ws")
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(self.reconnect_delay_ms));
        match self.max_reconnect_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            push_url: None,
            reconnect_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_reconnect_attempts: None,
            refresh_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_ms: 10_000,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("relaychat")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("relaychat")
    } else {
        PathBuf::from("/tmp/relaychat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay_ms, 3_000);
        assert_eq!(config.refresh_retry_delay_ms, 3_000);
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.push_endpoint(), "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn push_endpoint_follows_api_scheme() {
        let config = ClientConfig::for_relay("https://chat.example.com/");
        assert_eq!(config.push_endpoint(), "wss://chat.example.com/ws");

        let explicit = ClientConfig {
            push_url: Some("ws://push.example.com/socket".to_string()),
            ..ClientConfig::default()
        };
        assert_eq!(explicit.push_endpoint(), "ws://push.example.com/socket");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "api_url = \"http://relay.local:9000\"\nmax_reconnect_attempts = 5\n",
        )
        .unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.api_url, "http://relay.local:9000");
        assert_eq!(config.max_reconnect_attempts, Some(5));
        assert_eq!(config.reconnect_delay_ms, 3_000);
        assert_eq!(config.reconnect_policy().max_attempts(), Some(5));
    }

    #[test]
    fn invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "reconnect_delay_ms = \"soon\"\n").unwrap();

        let err = ClientConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }
}
