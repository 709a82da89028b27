//! Last known connectivity per environment, rebuilt from the daemon feed.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::WatcherRegistry;
use crate::docker::EnvironmentStatus;
use crate::events::DaemonEvent;

const STATUS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Default)]
pub struct StatusBoard {
    statuses: DashMap<String, EnvironmentStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &DaemonEvent) {
        let now = Utc::now();
        match event {
            DaemonEvent::Started { env } => {
                self.statuses.insert(
                    env.clone(),
                    EnvironmentStatus {
                        available: true,
                        message: String::new(),
                        updated_at: now,
                    },
                );
            }
            DaemonEvent::Stopped { env, message } => {
                self.statuses.insert(
                    env.clone(),
                    EnvironmentStatus {
                        available: false,
                        message: format!("{}, at {}", message, now.format(STATUS_TIME_FORMAT)),
                        updated_at: now,
                    },
                );
            }
            DaemonEvent::Message(_) => {}
        }
    }

    pub fn get(&self, env: &str) -> Option<EnvironmentStatus> {
        self.statuses.get(env).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, env: &str) {
        self.statuses.remove(env);
    }

    pub fn snapshot(&self) -> BTreeMap<String, EnvironmentStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Follow the feed. Events still queued for an environment that is no longer
    /// watched clear its entry instead of bringing it back.
    pub fn start(
        self: Arc<Self>,
        mut feed: broadcast::Receiver<DaemonEvent>,
        watchers: Arc<WatcherRegistry>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = feed.recv() => event,
                };
                match event {
                    Ok(event) if watchers.contains(event.env()) => self.apply(&event),
                    Ok(event) => self.remove(event.env()),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "status board fell behind the daemon feed");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{DaemonConnector, DaemonError, DaemonSession, Environment};
    use crate::monitor::{DaemonNotifier, WatcherSettings};
    use crate::websocket::Broadcaster;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl DaemonConnector for Offline {
        async fn connect(&self, _env: &Environment) -> Result<Box<dyn DaemonSession>, DaemonError> {
            Err(DaemonError::Connect("offline".to_string()))
        }
    }

    fn watching(names: &[&str]) -> Arc<WatcherRegistry> {
        let (bus, _bus_rx) = Broadcaster::new();
        let watchers = Arc::new(WatcherRegistry::new(
            Arc::new(Offline),
            DaemonNotifier::new(bus),
            WatcherSettings::default(),
            CancellationToken::new(),
        ));
        for name in names {
            watchers.join(Environment {
                name: name.to_string(),
                address: "tcp://10.0.0.9:2375".to_string(),
                tls: None,
                ssh: None,
                default: false,
            });
        }
        watchers
    }

    #[test]
    fn test_stop_then_start() {
        let board = StatusBoard::new();
        board.apply(&DaemonEvent::Stopped {
            env: "edge".to_string(),
            message: "connect failed: connection refused".to_string(),
        });

        let status = board.get("edge").unwrap();
        assert!(!status.available);
        assert!(status.message.starts_with("connect failed: connection refused, at "));
        // "<message>, at YYYY-mm-dd HH:MM:SS"
        let stamp = status.message.rsplit(", at ").next().unwrap();
        assert_eq!(stamp.len(), 19);

        board.apply(&DaemonEvent::Started {
            env: "edge".to_string(),
        });
        let status = board.get("edge").unwrap();
        assert!(status.available);
        assert!(status.message.is_empty());
        assert_eq!(board.snapshot().len(), 1);

        board.remove("edge");
        assert!(board.get("edge").is_none());
    }

    #[tokio::test]
    async fn test_follows_feed() {
        let (tx, rx) = broadcast::channel(8);
        let board = Arc::new(StatusBoard::new());
        let watchers = watching(&["local"]);
        let shutdown = CancellationToken::new();
        let task = board.clone().start(rx, watchers.clone(), shutdown.clone());

        tx.send(DaemonEvent::Started {
            env: "local".to_string(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(board.get("local").unwrap().available);
        watchers.close().await;
    }

    #[tokio::test]
    async fn test_queued_event_for_removed_environment_is_dropped() {
        let (tx, rx) = broadcast::channel(8);
        let board = Arc::new(StatusBoard::new());
        let watchers = watching(&["local", "edge"]);
        board.apply(&DaemonEvent::Started {
            env: "edge".to_string(),
        });

        // Still queued when the environment is removed.
        tx.send(DaemonEvent::Stopped {
            env: "edge".to_string(),
            message: "connection reset".to_string(),
        })
        .unwrap();
        assert!(watchers.leave("edge").await);
        board.remove("edge");

        let task = board.clone().start(rx, watchers.clone(), CancellationToken::new());
        drop(tx);
        task.await.unwrap();

        assert!(board.get("edge").is_none());
        assert_eq!(board.snapshot().len(), 0);
        watchers.close().await;
    }
}
