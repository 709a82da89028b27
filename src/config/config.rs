use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::docker::Environment;
use crate::monitor::WatcherSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthorizationConfig {
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub reconnect_backoff_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 5,
            ping_timeout_secs: 10,
        }
    }
}

impl MonitorConfig {
    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: String,
    pub flush_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "storage/audit.db".to_string(),
            flush_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Environment the explorer helper runs on
    pub env: String,
    pub container: String,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            env: crate::docker::environment::DEFAULT_ENVIRONMENT_NAME.to_string(),
            container: crate::container::explorer::DEFAULT_EXPLORER_CONTAINER.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host is empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".to_string()));
        }
        if self.authorization.enabled && self.authorization.token.is_empty() {
            return Err(ConfigError::Invalid(
                "authorization is enabled but no token is set".to_string(),
            ));
        }
        if self.monitor.reconnect_backoff_secs == 0 || self.monitor.ping_timeout_secs == 0 {
            return Err(ConfigError::Invalid("monitor intervals must be positive".to_string()));
        }
        if self.audit.enabled && self.audit.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid("audit.flush_interval_secs must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                return Err(ConfigError::Invalid("environment with empty name".to_string()));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate environment: {}", env.name)));
            }
            if let Some(ssh) = &env.ssh {
                if ssh.password.is_none() && ssh.private_key_path.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "environment {} has ssh settings without credentials",
                        env.name
                    )));
                }
            }
            env.endpoint().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Environments to join at startup. Falls back to the local daemon.
    pub fn initial_environments(&self) -> Vec<Environment> {
        if self.environments.is_empty() {
            return vec![Environment::local()];
        }
        self.environments.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{"server": {"host": "0.0.0.0", "port": 8807}}"#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(!config.authorization.enabled);
        assert_eq!(config.monitor.reconnect_backoff_secs, 5);
        assert_eq!(config.monitor.ping_timeout_secs, 10);
        assert_eq!(config.audit.flush_interval_secs, 10);
        assert_eq!(config.explorer.env, "local");

        let envs = config.initial_environments();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].name, "local");
        assert_eq!(
            config.monitor.watcher_settings().reconnect_backoff,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{"host": "127.0.0.1", "port": 9000}},
                "authorization": {{"enabled": true, "token": "secret"}},
                "environments": [
                    {{"name": "local", "address": "unix:///var/run/docker.sock", "default": true}},
                    {{"name": "edge", "address": "tcp://10.0.0.5:2375"}}
                ]
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.environments.len(), 2);
        assert!(config.environments[0].default);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/relayd.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            r#"{"server": {"host": "", "port": 8807}}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 0}}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 8807}, "authorization": {"enabled": true}}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 8807}, "monitor": {"reconnect_backoff_secs": 0}}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 8807}, "environments": [
                {"name": "a", "address": "tcp://h:1"}, {"name": "a", "address": "tcp://h:2"}]}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 8807}, "environments": [
                {"name": "b", "address": "ssh://h", "ssh": {"host": "h", "username": "root"}}]}"#,
            r#"{"server": {"host": "0.0.0.0", "port": 8807}, "environments": [
                {"name": "c", "address": "ftp://h"}]}"#,
        ];
        for case in cases {
            assert!(
                matches!(Config::parse(case), Err(ConfigError::Invalid(_))),
                "accepted: {}",
                case
            );
        }
    }
}
