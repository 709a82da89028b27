//! Daemon connections
//!
//! The monitor only needs three things from a daemon: a way to connect, a liveness
//! probe and a cancellable stream of raw events. `DaemonConnector` and
//! `DaemonSession` capture exactly that so the watcher loop can run against bollard
//! in production and an in-memory fake in tests.

use async_trait::async_trait;
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::environment::{Endpoint, Environment};
use super::tunnel::SshForward;

/// Seconds bollard waits on a single request before giving up.
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("event stream error: {0}")]
    Stream(String),

    #[error("ssh tunnel: {0}")]
    Tunnel(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
}

/// Raw daemon event before translation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
    pub time_nano: i64,
}

impl From<EventMessage> for RawEvent {
    fn from(message: EventMessage) -> Self {
        // The type enum serializes to the daemon's lowercase wire name.
        let kind = message
            .typ
            .and_then(|t| serde_json::to_value(t).ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let (actor_id, attributes) = match message.actor {
            Some(actor) => (actor.id.unwrap_or_default(), actor.attributes.unwrap_or_default()),
            None => (String::new(), HashMap::new()),
        };
        let time_nano = message
            .time_nano
            .or_else(|| message.time.map(|t| t.saturating_mul(1_000_000_000)))
            .unwrap_or_default();

        Self {
            kind,
            action: message.action.unwrap_or_default(),
            actor_id,
            attributes,
            time_nano,
        }
    }
}

/// One open connection to a daemon.
#[async_trait]
pub trait DaemonSession: Send + Sync {
    async fn ping(&self) -> Result<(), DaemonError>;

    /// Raw event feed. Ends when the daemon connection drops.
    fn events(&self) -> BoxStream<'static, Result<RawEvent, DaemonError>>;

    /// Underlying API client, for operations that stream progress.
    fn docker(&self) -> Option<Docker> {
        None
    }

    async fn close(&self);
}

#[async_trait]
pub trait DaemonConnector: Send + Sync {
    async fn connect(&self, env: &Environment) -> Result<Box<dyn DaemonSession>, DaemonError>;
}

/// Connects with bollard, tunnelling over SSH where the environment asks for it.
#[derive(Debug, Default, Clone)]
pub struct BollardConnector;

impl BollardConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DaemonConnector for BollardConnector {
    async fn connect(&self, env: &Environment) -> Result<Box<dyn DaemonSession>, DaemonError> {
        let endpoint = env.endpoint().map_err(DaemonError::InvalidEnvironment)?;

        let (docker, tunnel) = match endpoint {
            Endpoint::Unix(path) => (connect_unix(path)?, None),
            Endpoint::Http(address) => (
                Docker::connect_with_http(address, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(|e| DaemonError::Connect(e.to_string()))?,
                None,
            ),
            Endpoint::Tls(address, tls) => (
                Docker::connect_with_ssl(
                    address,
                    &tls.key,
                    &tls.cert,
                    &tls.ca,
                    REQUEST_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(|e| DaemonError::Connect(e.to_string()))?,
                None,
            ),
            Endpoint::Ssh(settings) => {
                let forward = SshForward::open(settings).await?;
                let address = format!("tcp://{}", forward.local_addr());
                let docker = Docker::connect_with_http(&address, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(|e| DaemonError::Connect(e.to_string()))?;
                (docker, Some(forward))
            }
        };

        tracing::debug!(env = %env.name, "daemon client created");
        Ok(Box::new(BollardSession { docker, tunnel }))
    }
}

#[cfg(unix)]
fn connect_unix(path: &str) -> Result<Docker, DaemonError> {
    Docker::connect_with_unix(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        .map_err(|e| DaemonError::Connect(e.to_string()))
}

#[cfg(not(unix))]
fn connect_unix(path: &str) -> Result<Docker, DaemonError> {
    Err(DaemonError::InvalidEnvironment(format!("unix sockets are not available here: {}", path)))
}

pub struct BollardSession {
    docker: Docker,
    tunnel: Option<SshForward>,
}

#[async_trait]
impl DaemonSession for BollardSession {
    async fn ping(&self) -> Result<(), DaemonError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DaemonError::Ping(e.to_string()))
    }

    fn events(&self) -> BoxStream<'static, Result<RawEvent, DaemonError>> {
        self.docker
            .events(Some(EventsOptions::<String>::default()))
            .map(|item| match item {
                Ok(message) => Ok(RawEvent::from(message)),
                Err(e) => Err(DaemonError::Stream(e.to_string())),
            })
            .boxed()
    }

    fn docker(&self) -> Option<Docker> {
        Some(self.docker.clone())
    }

    async fn close(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}
