//! Environment watcher
//!
//! One task per environment. It connects, probes the daemon, relays its event
//! stream and reconnects after a fixed backoff whenever anything fails. Only its
//! cancellation token (Leave or process shutdown) ends it for good.
//!
//! ```text
//! Disconnected -> Connecting -> Live -> Reconnecting -> Connecting ...
//!                                    \-> Closing -> Closed
//! ```

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::notifier::DaemonNotifier;
use super::registry::WatcherEntry;
use crate::docker::{DaemonConnector, DaemonError, DaemonSession, Environment};
use crate::events::{translate, DaemonEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Live,
    Reconnecting,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    pub reconnect_backoff: Duration,
    pub ping_timeout: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a live session ended.
enum SessionEnd {
    Cancelled,
    Dropped(String),
}

pub struct EnvironmentWatcher {
    id: u64,
    env: Environment,
    connector: Arc<dyn DaemonConnector>,
    notifier: DaemonNotifier,
    settings: WatcherSettings,
    cancel: CancellationToken,
    state: watch::Sender<WatcherState>,
    registry: Weak<DashMap<String, WatcherEntry>>,
}

impl EnvironmentWatcher {
    pub(super) fn new(
        id: u64,
        env: Environment,
        connector: Arc<dyn DaemonConnector>,
        notifier: DaemonNotifier,
        settings: WatcherSettings,
        cancel: CancellationToken,
        registry: Weak<DashMap<String, WatcherEntry>>,
    ) -> (Self, watch::Receiver<WatcherState>) {
        let (state, state_rx) = watch::channel(WatcherState::Disconnected);
        (
            Self {
                id,
                env,
                connector,
                notifier,
                settings,
                cancel,
                state,
                registry,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: WatcherState) {
        tracing::debug!(env = %self.env.name, ?state, "watcher state");
        self.state.send_replace(state);
    }

    pub async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(WatcherState::Connecting);

            let session = tokio::select! {
                _ = self.cancel.cancelled() => break,
                session = self.open() => session,
            };
            let session = match session {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!(env = %self.env.name, "daemon unavailable: {}", e);
                    self.notifier.publish(DaemonEvent::Stopped {
                        env: self.env.name.clone(),
                        message: e.to_string(),
                    });
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(WatcherState::Live);
            tracing::info!(env = %self.env.name, "daemon connected");
            self.notifier.publish(DaemonEvent::Started {
                env: self.env.name.clone(),
            });

            let end = self.listen(session.as_ref()).await;
            session.close().await;

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Dropped(reason) => {
                    tracing::warn!(env = %self.env.name, "daemon connection lost: {}", reason);
                    self.notifier.connection_lost(&self.env.name, &reason);
                    self.notifier.publish(DaemonEvent::Stopped {
                        env: self.env.name.clone(),
                        message: reason,
                    });
                    self.set_state(WatcherState::Reconnecting);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.set_state(WatcherState::Closing);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.env.name, |_, entry| entry.id == self.id);
        }
        self.set_state(WatcherState::Closed);
        tracing::info!(env = %self.env.name, "watcher stopped");
    }

    /// Connect and probe. A half-open connection is closed before returning an error.
    async fn open(&self) -> Result<Box<dyn DaemonSession>, DaemonError> {
        let session = self.connector.connect(&self.env).await?;
        let ping = tokio::time::timeout(self.settings.ping_timeout, session.ping()).await;
        let result = match ping {
            Ok(Ok(())) => return Ok(session),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DaemonError::PingTimeout(self.settings.ping_timeout)),
        };
        session.close().await;
        result
    }

    async fn listen(&self, session: &dyn DaemonSession) -> SessionEnd {
        let mut events = session.events();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = events.next() => next,
            };
            match next {
                Some(Ok(raw)) => {
                    if let Some(event) = translate(&self.env.name, &raw) {
                        tracing::debug!(
                            env = %self.env.name,
                            kind = event.kind(),
                            at = %event.timestamp(),
                            "{}",
                            event.message
                        );
                        self.notifier.publish(DaemonEvent::Message(event));
                    }
                }
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("event stream closed".to_string()),
            }
        }
    }

    /// Sleep for the backoff. Returns false if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.reconnect_backoff) => true,
        }
    }
}
