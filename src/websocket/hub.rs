//! Connection hub
//!
//! Tracks every live [`ClientConnection`] by fd and drains the Broadcast bus from
//! a single fan-out task. Delivery only enqueues onto each client's outbound
//! queue, so one slow socket never holds up the others; a client whose queue is
//! gone is made to leave.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::Broadcaster;
use super::client::{ClientConnection, CloseProgress, HandlerTable};
use super::progress::ProgressRegistry;
use super::protocol::{ClientMessage, MESSAGE_TYPE_PROGRESS_CLOSE};

/// Notified synchronously whenever the number of connected clients changes.
pub trait ClientCountObserver: Send + Sync {
    fn client_count_changed(&self, total: usize);
}

pub struct ConnectionHub {
    clients: DashMap<String, Arc<ClientConnection>>,
    progress: Arc<ProgressRegistry>,
    bus: Broadcaster,
    handlers: HandlerTable,
    observers: Mutex<Vec<Arc<dyn ClientCountObserver>>>,
}

impl ConnectionHub {
    pub fn new(progress: Arc<ProgressRegistry>, bus: Broadcaster) -> Self {
        let mut handlers = HandlerTable::new();
        handlers.insert(MESSAGE_TYPE_PROGRESS_CLOSE, Arc::new(CloseProgress::new(progress.clone())));
        Self {
            clients: DashMap::new(),
            progress,
            bus,
            handlers,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ClientCountObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    pub fn bus(&self) -> &Broadcaster {
        &self.bus
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    pub fn total(&self) -> usize {
        self.clients.len()
    }

    pub fn contains(&self, fd: &str) -> bool {
        self.clients.contains_key(fd)
    }

    pub fn join(&self, client: Arc<ClientConnection>) {
        let fd = client.fd().to_string();
        let user = client.user_id().to_string();
        if let Some(previous) = self.clients.insert(fd.clone(), client) {
            previous.close();
        }
        let total = self.total();
        tracing::info!(fd = %fd, user = %user, total, progress = self.progress.len(), "client joined");
        self.notify(total);
    }

    /// Remove a client, close it and release its progress subscriptions.
    /// Returns false if the fd was already gone.
    pub fn leave(&self, fd: &str) -> bool {
        let Some((_, client)) = self.clients.remove(fd) else {
            return false;
        };
        client.close();
        self.progress.release_client(fd);

        let total = self.total();
        tracing::info!(fd = %fd, total, "client left");
        self.notify(total);
        true
    }

    fn notify(&self, total: usize) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for observer in observers {
            observer.client_count_changed(total);
        }
    }

    fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Deliver one message: to its target fd if set, else to every client.
    pub fn broadcast(&self, message: ClientMessage) {
        if message.is_targeted() {
            let target = self.clients.get(&message.fd).map(|entry| entry.value().clone());
            match target {
                Some(client) => {
                    if client.send(message).is_err() {
                        self.leave(client.fd());
                    }
                }
                None => tracing::debug!(fd = %message.fd, "target client not connected"),
            }
            return;
        }

        let mut failed = Vec::new();
        for client in self.snapshot() {
            if client.send(message.clone()).is_err() {
                failed.push(client.fd().to_string());
            }
        }
        for fd in failed {
            tracing::warn!(fd = %fd, "broadcast failed, dropping client");
            self.leave(&fd);
        }
    }

    /// Fan-out task: drains the bus in order until shutdown or until every
    /// publisher is gone.
    pub fn start(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ClientMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                self.broadcast(message);
            }
            for client in self.snapshot() {
                self.leave(client.fd());
            }
            tracing::info!("connection hub stopped");
        })
    }
}
