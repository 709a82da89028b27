//! Watcher registry
//!
//! At most one watcher per environment name. Each watcher's token is a child of
//! the registry's root token, so cancelling the root stops every watcher while a
//! Leave stops exactly one.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::notifier::DaemonNotifier;
use super::watcher::{EnvironmentWatcher, WatcherSettings, WatcherState};
use crate::docker::{DaemonConnector, DaemonError, DaemonSession, Environment};
use crate::events::DaemonEvent;

pub(super) struct WatcherEntry {
    pub(super) id: u64,
    env: Environment,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    state: watch::Receiver<WatcherState>,
}

pub struct WatcherRegistry {
    watchers: Arc<DashMap<String, WatcherEntry>>,
    connector: Arc<dyn DaemonConnector>,
    notifier: DaemonNotifier,
    settings: WatcherSettings,
    root: CancellationToken,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    pub fn new(
        connector: Arc<dyn DaemonConnector>,
        notifier: DaemonNotifier,
        settings: WatcherSettings,
        root: CancellationToken,
    ) -> Self {
        Self {
            watchers: Arc::new(DashMap::new()),
            connector,
            notifier,
            settings,
            root,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start watching `env`. A second Join for a watched name is a no-op and
    /// returns false.
    pub fn join(&self, env: Environment) -> bool {
        if self.root.is_cancelled() {
            tracing::warn!(env = %env.name, "registry closed, join ignored");
            return false;
        }

        let name = env.name.clone();
        let entry = match self.watchers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(env = %name, "environment already watched");
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.root.child_token();
        let (watcher, state) = EnvironmentWatcher::new(
            id,
            env.clone(),
            self.connector.clone(),
            self.notifier.clone(),
            self.settings,
            cancel.clone(),
            Arc::downgrade(&self.watchers),
        );
        // The entry guard holds the shard lock; the watcher only touches the map
        // on exit, after it has been cancelled and the guard released.
        let handle = tokio::spawn(watcher.run());
        entry.insert(WatcherEntry {
            id,
            env,
            cancel,
            handle,
            state,
        });

        tracing::info!(env = %name, total = self.watchers.len(), "environment joined");
        true
    }

    /// Stop and forget one watcher. Waits for its task to finish so no watcher
    /// outlives its entry.
    pub async fn leave(&self, name: &str) -> bool {
        let Some((_, entry)) = self.watchers.remove(name) else {
            return false;
        };
        entry.cancel.cancel();
        if let Err(e) = entry.handle.await {
            tracing::warn!(env = %name, "watcher task ended abnormally: {}", e);
        }
        tracing::info!(env = %name, total = self.watchers.len(), "environment left");
        true
    }

    /// Leave then Join, used when an environment's settings change.
    pub async fn replace(&self, env: Environment) -> bool {
        self.leave(&env.name).await;
        self.join(env)
    }

    /// Cancel every watcher and wait for all of them.
    pub async fn close(&self) {
        let names: Vec<String> = self.watchers.iter().map(|entry| entry.key().clone()).collect();
        let entries: Vec<WatcherEntry> = names
            .iter()
            .filter_map(|name| self.watchers.remove(name).map(|(_, entry)| entry))
            .collect();
        self.root.cancel();
        for entry in entries {
            if let Err(e) = entry.handle.await {
                tracing::warn!(env = %entry.env.name, "watcher task ended abnormally: {}", e);
            }
        }
        tracing::info!("all environment watchers stopped");
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.watchers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn environment(&self, name: &str) -> Option<Environment> {
        self.watchers.get(name).map(|entry| entry.env.clone())
    }

    pub fn state(&self, name: &str) -> Option<WatcherState> {
        self.watchers.get(name).map(|entry| *entry.state.borrow())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.notifier.subscribe()
    }

    /// Fresh session to a watched environment, for one-off operations.
    pub async fn connect(&self, name: &str) -> Result<Box<dyn DaemonSession>, DaemonError> {
        let env = self
            .environment(name)
            .ok_or_else(|| DaemonError::InvalidEnvironment(format!("unknown environment: {}", name)))?;
        self.connector.connect(&env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::RawEvent;
    use crate::websocket::Broadcaster;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Refuses every connection and counts attempts.
    struct Unreachable {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DaemonConnector for Unreachable {
        async fn connect(&self, _env: &Environment) -> Result<Box<dyn DaemonSession>, DaemonError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DaemonError::Connect("connection refused".to_string()))
        }
    }

    /// Hands out sessions whose event feed is driven by the test.
    struct Scripted {
        feeds: std::sync::Mutex<Vec<mpsc::UnboundedReceiver<Result<RawEvent, DaemonError>>>>,
        ping_ok: bool,
        closed: Arc<AtomicUsize>,
    }

    struct ScriptedSession {
        feed: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<RawEvent, DaemonError>>>>,
        ping_ok: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DaemonSession for ScriptedSession {
        async fn ping(&self) -> Result<(), DaemonError> {
            if self.ping_ok {
                Ok(())
            } else {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        fn events(&self) -> BoxStream<'static, Result<RawEvent, DaemonError>> {
            match self.feed.lock().unwrap().take() {
                Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
                None => futures::stream::empty().boxed(),
            }
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DaemonConnector for Scripted {
        async fn connect(&self, _env: &Environment) -> Result<Box<dyn DaemonSession>, DaemonError> {
            let feed = self.feeds.lock().unwrap().pop();
            Ok(Box::new(ScriptedSession {
                feed: std::sync::Mutex::new(feed),
                ping_ok: self.ping_ok,
                closed: self.closed.clone(),
            }))
        }
    }

    fn env(name: &str) -> Environment {
        Environment {
            name: name.to_string(),
            address: "tcp://10.0.0.9:2375".to_string(),
            tls: None,
            ssh: None,
            default: false,
        }
    }

    fn new_registry(
        connector: Arc<dyn DaemonConnector>,
    ) -> (WatcherRegistry, mpsc::UnboundedReceiver<crate::websocket::protocol::ClientMessage>) {
        let (bus, bus_rx) = Broadcaster::new();
        let registry = WatcherRegistry::new(
            connector,
            DaemonNotifier::new(bus),
            WatcherSettings::default(),
            CancellationToken::new(),
        );
        (registry, bus_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_daemon_retries_on_backoff() {
        let connector = Arc::new(Unreachable {
            attempts: AtomicUsize::new(0),
        });
        let (registry, _bus_rx) = new_registry(connector.clone());
        let mut feed = registry.subscribe();

        assert!(registry.join(env("edge")));
        tokio::time::sleep(Duration::from_secs(29)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
        let mut stops = 0;
        while let Ok(event) = feed.try_recv() {
            match event {
                DaemonEvent::Stopped { env, message } => {
                    assert_eq!(env, "edge");
                    assert!(message.contains("connection refused"));
                    stops += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(stops, 6);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_leave_restores_count() {
        let connector = Arc::new(Unreachable {
            attempts: AtomicUsize::new(0),
        });
        let (registry, _bus_rx) = new_registry(connector);

        assert!(registry.join(env("edge")));
        assert!(!registry.join(env("edge")));
        assert_eq!(registry.len(), 1);

        assert!(registry.join(env("lab")));
        assert_eq!(registry.len(), 2);
        assert!(registry.leave("lab").await);
        assert!(!registry.leave("lab").await);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["edge".to_string()]);

        registry.close().await;
        assert!(registry.is_empty());
        assert!(!registry.join(env("late")));
    }

    #[tokio::test]
    async fn test_live_session_relays_translated_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(Scripted {
            feeds: std::sync::Mutex::new(vec![rx]),
            ping_ok: true,
            closed: closed.clone(),
        });
        let (registry, mut bus_rx) = new_registry(connector);
        let mut feed = registry.subscribe();
        registry.join(env("edge"));

        assert_eq!(
            feed.recv().await.unwrap(),
            DaemonEvent::Started {
                env: "edge".to_string()
            }
        );
        assert_eq!(registry.state("edge"), Some(WatcherState::Live));

        tx.send(Ok(RawEvent {
            kind: "container".to_string(),
            action: "exec_start".to_string(),
            ..Default::default()
        }))
        .unwrap();
        tx.send(Ok(RawEvent {
            kind: "container".to_string(),
            action: "start".to_string(),
            actor_id: "abc".to_string(),
            attributes: HashMap::from([("name".to_string(), "web".to_string())]),
            time_nano: 42,
        }))
        .unwrap();

        match feed.recv().await.unwrap() {
            DaemonEvent::Message(event) => {
                assert_eq!(event.env, "edge");
                assert_eq!(event.action, "container/start");
                assert_eq!(event.message, "web");
                assert_eq!(event.time_nano, 42);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let started = bus_rx.recv().await.unwrap();
        assert_eq!(started.data["type"], "docker_start");
        let message = bus_rx.recv().await.unwrap();
        assert_eq!(message.data["type"], "docker_message");

        assert!(registry.leave("edge").await);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_reports_stop_and_reconnects() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (_second_tx, second_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(Scripted {
            // popped from the back
            feeds: std::sync::Mutex::new(vec![second_rx, first_rx]),
            ping_ok: true,
            closed: closed.clone(),
        });
        let (registry, mut bus_rx) = new_registry(connector);
        let mut feed = registry.subscribe();
        registry.join(env("edge"));

        assert!(matches!(feed.recv().await.unwrap(), DaemonEvent::Started { .. }));
        first_tx
            .send(Err(DaemonError::Stream("unexpected EOF".to_string())))
            .unwrap();

        match feed.recv().await.unwrap() {
            DaemonEvent::Stopped { message, .. } => assert!(message.contains("unexpected EOF")),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(feed.recv().await.unwrap(), DaemonEvent::Started { .. }));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let frames: Vec<String> = std::iter::from_fn(|| bus_rx.try_recv().ok())
            .map(|frame| match frame.message_type.as_str() {
                "notice" => {
                    assert_eq!(frame.data["type"], "warning");
                    assert!(frame.data["message"].as_str().unwrap().starts_with("edge: "));
                    "notice".to_string()
                }
                _ => frame.data["type"].as_str().unwrap().to_string(),
            })
            .collect();
        assert_eq!(frames, vec!["docker_start", "notice", "docker_stop", "docker_start"]);

        registry.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_closes_half_open_session() {
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(Scripted {
            feeds: std::sync::Mutex::new(Vec::new()),
            ping_ok: false,
            closed: closed.clone(),
        });
        let (registry, _bus_rx) = new_registry(connector);
        let mut feed = registry.subscribe();
        registry.join(env("edge"));

        match feed.recv().await.unwrap() {
            DaemonEvent::Stopped { message, .. } => assert!(message.contains("ping timed out")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        registry.close().await;
    }
}
