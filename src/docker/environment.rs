//! Environment descriptors
//!
//! An environment is a named connection target for one container-engine daemon:
//! a local socket, a TCP endpoint (optionally with TLS material) or an SSH tunnel
//! to the daemon socket on a remote host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name reserved for the daemon running next to relayd.
pub const DEFAULT_ENVIRONMENT_NAME: &str = "local";

const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    /// `unix:///path`, `tcp://host:port`, `http://host:port` or `ssh://host`
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    #[serde(default)]
    pub ssh: Option<SshTunnel>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnel {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Daemon socket on the remote host
    #[serde(default = "default_remote_socket")]
    pub socket_path: String,
    /// Pinned host keys; `~/.ssh/known_hosts` when unset
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_socket() -> String {
    DEFAULT_REMOTE_SOCKET.to_string()
}

/// How the connector should reach the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint<'a> {
    Unix(&'a str),
    Http(&'a str),
    Tls(&'a str, &'a TlsMaterial),
    Ssh(&'a SshTunnel),
}

impl Environment {
    pub fn local() -> Self {
        Self {
            name: DEFAULT_ENVIRONMENT_NAME.to_string(),
            address: format!("unix://{}", DEFAULT_REMOTE_SOCKET),
            tls: None,
            ssh: None,
            default: true,
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint<'_>, String> {
        if let Some(ssh) = &self.ssh {
            return Ok(Endpoint::Ssh(ssh));
        }
        if let Some(path) = self.address.strip_prefix("unix://") {
            return Ok(Endpoint::Unix(path));
        }
        if self.address.starts_with("tcp://") || self.address.starts_with("http://") {
            return Ok(match &self.tls {
                Some(tls) => Endpoint::Tls(&self.address, tls),
                None => Endpoint::Http(&self.address),
            });
        }
        if self.address.starts_with("ssh://") {
            return Err(format!("environment {} uses ssh:// without tunnel settings", self.name));
        }
        Err(format!("unsupported daemon address: {}", self.address))
    }
}

/// Cached connectivity of an environment as last reported by its watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub available: bool,
    pub message: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(address: &str) -> Environment {
        Environment {
            name: "test".to_string(),
            address: address.to_string(),
            tls: None,
            ssh: None,
            default: false,
        }
    }

    #[test]
    fn test_endpoint_schemes() {
        assert_eq!(env("unix:///run/docker.sock").endpoint(), Ok(Endpoint::Unix("/run/docker.sock")));
        assert_eq!(env("tcp://10.0.0.2:2375").endpoint(), Ok(Endpoint::Http("tcp://10.0.0.2:2375")));
        assert!(env("ftp://nowhere").endpoint().is_err());
        assert!(env("ssh://host").endpoint().is_err());
    }

    #[test]
    fn test_tls_and_ssh_take_precedence() {
        let mut tls_env = env("tcp://10.0.0.2:2376");
        tls_env.tls = Some(TlsMaterial {
            ca: "ca.pem".into(),
            cert: "cert.pem".into(),
            key: "key.pem".into(),
        });
        assert!(matches!(tls_env.endpoint(), Ok(Endpoint::Tls(_, _))));

        let ssh_env: Environment = serde_json::from_str(
            r#"{"name":"edge","address":"ssh://edge","ssh":{"host":"edge","username":"ops","password":"pw"}}"#,
        )
        .unwrap();
        match ssh_env.endpoint() {
            Ok(Endpoint::Ssh(tunnel)) => {
                assert_eq!(tunnel.port, 22);
                assert_eq!(tunnel.socket_path, "/var/run/docker.sock");
            }
            other => panic!("unexpected endpoint {:?}", other),
        }
    }
}
