//! SSH forwarding for remote daemons
//!
//! Opens one russh client session per environment, binds a loopback listener and
//! pipes every accepted connection through a `direct-streamlocal` channel to the
//! daemon socket on the remote host. bollard then talks plain HTTP to the listener.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connector::DaemonError;
use super::environment::SshTunnel;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host keys are trusted on first use and pinned in a known_hosts file.
struct TunnelClient {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match verify_host_key(&self.host, self.port, server_public_key, self.known_hosts.as_deref()) {
            Ok(accepted) => Ok(accepted),
            Err(russh_keys::Error::KeyChanged { line }) => {
                tracing::error!(
                    host = %self.host,
                    "host key changed (known_hosts line {}), refusing to connect",
                    line
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Accepts a recorded key, learns an unknown host, and fails with `KeyChanged`
/// when the host presents a different key than the one recorded.
fn verify_host_key(
    host: &str,
    port: u16,
    key: &PublicKey,
    known_hosts: Option<&Path>,
) -> Result<bool, russh_keys::Error> {
    let known = match known_hosts {
        Some(path) => russh_keys::check_known_hosts_path(host, port, key, path)?,
        None => russh_keys::check_known_hosts(host, port, key)?,
    };
    if known {
        return Ok(true);
    }

    match known_hosts {
        Some(path) => russh_keys::learn_known_hosts_path(host, port, key, path)?,
        None => russh_keys::learn_known_hosts(host, port, key)?,
    }
    tracing::info!(host = %host, port, "learned new ssh host key");
    Ok(true)
}

pub struct SshForward {
    local_addr: SocketAddr,
    session: Arc<Handle<TunnelClient>>,
    shutdown: CancellationToken,
}

impl SshForward {
    pub async fn open(settings: &SshTunnel) -> Result<Self, DaemonError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let handler = TunnelClient {
            host: settings.host.clone(),
            port: settings.port,
            known_hosts: settings.known_hosts_path.clone(),
        };
        let connect = client::connect(config, (settings.host.as_str(), settings.port), handler);
        let mut session = tokio::time::timeout(SSH_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| DaemonError::Tunnel(format!("connect to {} timed out", settings.host)))?
            .map_err(|e| DaemonError::Tunnel(e.to_string()))?;

        let authenticated = if let Some(key_path) = &settings.private_key_path {
            let key = russh_keys::load_secret_key(key_path, None)
                .map_err(|e| DaemonError::Tunnel(format!("load key {}: {}", key_path.display(), e)))?;
            session
                .authenticate_publickey(settings.username.as_str(), Arc::new(key))
                .await
                .map_err(|e| DaemonError::Tunnel(e.to_string()))?
        } else if let Some(password) = &settings.password {
            session
                .authenticate_password(settings.username.as_str(), password.as_str())
                .await
                .map_err(|e| DaemonError::Tunnel(e.to_string()))?
        } else {
            return Err(DaemonError::Tunnel("no ssh credentials configured".to_string()));
        };
        if !authenticated {
            return Err(DaemonError::Tunnel(format!("authentication rejected for {}", settings.username)));
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DaemonError::Tunnel(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| DaemonError::Tunnel(e.to_string()))?;

        let session = Arc::new(session);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            session.clone(),
            settings.socket_path.clone(),
            shutdown.clone(),
        ));

        tracing::info!(host = %settings.host, local = %local_addr, "ssh tunnel established");
        Ok(Self {
            local_addr,
            session,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("ssh disconnect: {}", e);
        }
    }
}

impl Drop for SshForward {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Handle<TunnelClient>>,
    socket_path: String,
    shutdown: CancellationToken,
) {
    loop {
        let (mut local, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("ssh tunnel accept failed: {}", e);
                    continue;
                }
            },
        };

        let channel = match session.channel_open_direct_streamlocal(socket_path.as_str()).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("ssh tunnel channel open failed: {}", e);
                continue;
            }
        };

        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut remote = channel.into_stream();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                    if let Err(e) = result {
                        tracing::debug!("ssh tunnel stream closed: {}", e);
                    }
                }
            }
        });
    }
    tracing::debug!("ssh tunnel listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;

    fn host_key() -> PublicKey {
        KeyPair::generate_ed25519().unwrap().clone_public_key().unwrap()
    }

    #[test]
    fn test_unknown_host_is_learned_then_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = host_key();

        assert!(verify_host_key("build01", 2222, &key, Some(&path)).unwrap());
        assert!(path.exists());
        assert!(russh_keys::check_known_hosts_path("build01", 2222, &key, &path).unwrap());

        // Second contact with the same key is accepted without relearning.
        assert!(verify_host_key("build01", 2222, &key, Some(&path)).unwrap());
    }

    #[test]
    fn test_changed_host_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        verify_host_key("build01", 22, &host_key(), Some(&path)).unwrap();
        let result = verify_host_key("build01", 22, &host_key(), Some(&path));
        assert!(matches!(result, Err(russh_keys::Error::KeyChanged { .. })));
    }
}
