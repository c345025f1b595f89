//! Configuration management for sluice.
//!
//! Handles loading and saving configuration from the platform config
//! directory (e.g. `~/.config/sluice/config.toml`). Every value is optional;
//! command-line flags take precedence and built-in defaults fill the rest.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::Credentials;
use crate::protocol::{
    DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_MAX,
    DEFAULT_POLL_MIN, DEFAULT_PROXY_AGENT, DEFAULT_REQUEST_TIMEOUT,
};

pub const DEFAULT_CLIENT_LISTEN: &str = "127.0.0.1:8888";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
pub const DEFAULT_SERVER_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay server, with or without `http://`
    pub server: Option<String>,
    pub listen: Option<String>,
    pub forward_proxy: Option<String>,
    pub buffer_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub forward_proxy: Option<String>,
    pub buffer_size: Option<usize>,
    pub proxy_agent: Option<String>,
    pub poll_min_ms: Option<u64>,
    pub poll_max_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthConfig {
    /// Credentials are only in effect when both halves are present.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
            _ => None,
        }
    }
}

impl Config {
    /// Every setting filled in with its built-in default, for `init-config`
    pub fn with_defaults() -> Self {
        Self {
            client: ClientConfig {
                server: Some(DEFAULT_SERVER_URL.to_string()),
                listen: Some(DEFAULT_CLIENT_LISTEN.to_string()),
                forward_proxy: None,
                buffer_size: Some(DEFAULT_BUFFER_SIZE),
                poll_interval_ms: Some(DEFAULT_POLL_INTERVAL.as_millis() as u64),
            },
            server: ServerConfig {
                listen: Some(DEFAULT_SERVER_LISTEN.to_string()),
                forward_proxy: None,
                buffer_size: Some(DEFAULT_BUFFER_SIZE),
                proxy_agent: Some(DEFAULT_PROXY_AGENT.to_string()),
                poll_min_ms: Some(DEFAULT_POLL_MIN.as_millis() as u64),
                poll_max_ms: Some(DEFAULT_POLL_MAX.as_millis() as u64),
                request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT.as_secs()),
                idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT.as_secs()),
            },
            auth: AuthConfig::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "sluice").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(config.client.server.is_none());
        assert!(config.auth.credentials().is_none());
    }

    #[test]
    fn test_parse_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[client]
server = "relay.example.com:8080"
forward_proxy = "10.0.0.1:3128"

[server]
poll_max_ms = 5000

[auth]
username = "alice"
password = "secret"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.client.server.as_deref(),
            Some("relay.example.com:8080")
        );
        assert_eq!(config.client.forward_proxy.as_deref(), Some("10.0.0.1:3128"));
        assert_eq!(config.server.poll_max_ms, Some(5000));
        assert_eq!(
            config.auth.credentials(),
            Some(Credentials::new("alice", "secret"))
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.listen = Some("0.0.0.0:9000".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.listen.as_deref(), Some("0.0.0.0:9000"));
    }

    #[test]
    fn test_defaults_survive_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::with_defaults().save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.client.listen.as_deref(), Some(DEFAULT_CLIENT_LISTEN));
        assert_eq!(loaded.server.poll_min_ms, Some(100));
        assert_eq!(loaded.server.poll_max_ms, Some(3000));
        assert!(loaded.client.forward_proxy.is_none());
        assert!(loaded.auth.credentials().is_none());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[client\nserver = ").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
