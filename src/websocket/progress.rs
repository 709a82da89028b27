//! Named progress channels
//!
//! Every long-running operation (image pull, build, compose deploy, certificate
//! issuance, log tail) streams its output through a [`ProgressChannel`] looked up
//! by a stable name such as `image:pull:nginx:latest`. At most one generation per
//! name is reachable: opening a name again cancels the previous generation, whose
//! writes then become no-ops.
//!
//! Cancellation is cooperative. A producer should watch [`ProgressChannel::done`]
//! and stop issuing writes; one in-flight write may still race the cancel and is
//! simply dropped.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::bus::Broadcaster;
use super::protocol::ClientMessage;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProgressError {
    /// The write hook rejected the chunk.
    #[error("progress hook failed: {0}")]
    Hook(String),

    /// The daemon reported a failure inside its progress stream.
    #[error("{0}")]
    Daemon(String),
}

/// Strategy for turning raw producer output into client messages.
///
/// A hook may buffer, parse or filter. It forwards what it wants through
/// [`ProgressChannel::emit`].
pub trait WriteHook: Send + Sync {
    fn handle(&self, channel: &ProgressChannel, data: &[u8]) -> Result<(), ProgressError>;
}

type ChannelMap = DashMap<String, Arc<ProgressChannel>>;

pub struct ProgressChannel {
    name: String,
    generation: u64,
    keep_alive: bool,
    cancel: CancellationToken,
    hook: Mutex<Option<Arc<dyn WriteHook>>>,
    subscribers: Mutex<HashSet<String>>,
    bus: Broadcaster,
    channels: Weak<ChannelMap>,
}

impl ProgressChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this generation is closed or superseded.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn set_hook(&self, hook: Arc<dyn WriteHook>) {
        *self.hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    pub fn subscribe(&self, fd: &str) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(fd.to_string());
    }

    pub fn subscribers(&self) -> Vec<String> {
        let mut fds: Vec<String> = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        fds.sort();
        fds
    }

    /// Feed raw producer output. A no-op once the channel is closed.
    pub fn write(&self, data: &[u8]) -> Result<(), ProgressError> {
        if self.is_closed() {
            return Ok(());
        }
        let hook = self.hook.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match hook {
            Some(hook) => hook.handle(self, data),
            None => {
                self.emit(Value::String(String::from_utf8_lossy(data).into_owned()));
                Ok(())
            }
        }
    }

    /// Publish one payload under the channel name. Without subscribers the message
    /// goes to every client, otherwise one targeted copy per subscriber.
    pub fn emit(&self, data: Value) {
        if self.is_closed() {
            return;
        }
        let subscribers = self.subscribers();
        if subscribers.is_empty() {
            self.bus.publish(ClientMessage::new(self.name.clone(), data));
            return;
        }
        for fd in subscribers {
            self.bus
                .publish(ClientMessage::new(self.name.clone(), data.clone()).to(fd));
        }
    }

    /// Report a failure as the final message, then close.
    pub fn fail(&self, error: &str) {
        self.emit(json!({ "error": error }));
        self.close();
    }

    /// Cancel this generation and unregister it, unless a newer generation has
    /// already taken the name.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(channels) = self.channels.upgrade() {
            let removed = channels.remove_if(&self.name, |_, current| current.generation == self.generation);
            if removed.is_some() {
                tracing::debug!(channel = %self.name, generation = self.generation, "progress channel closed");
            }
        }
    }

    /// Drop `fd` from the subscriber set. A transient channel whose last
    /// subscriber leaves is closed. Returns whether the channel was closed.
    pub fn close_by_client(&self, fd: &str) -> bool {
        let now_empty = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subscribers.remove(fd) && subscribers.is_empty()
        };
        if now_empty && !self.keep_alive {
            self.close();
            return true;
        }
        false
    }
}

/// Owns every live progress channel, keyed by name.
pub struct ProgressRegistry {
    channels: Arc<ChannelMap>,
    bus: Broadcaster,
    next_generation: AtomicU64,
}

impl ProgressRegistry {
    pub fn new(bus: Broadcaster) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            bus,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Open a new generation under `name`, superseding any existing one.
    pub fn open(&self, name: &str, keep_alive: bool) -> Arc<ProgressChannel> {
        let channel = Arc::new(ProgressChannel {
            name: name.to_string(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            keep_alive,
            cancel: CancellationToken::new(),
            hook: Mutex::new(None),
            subscribers: Mutex::new(HashSet::new()),
            bus: self.bus.clone(),
            channels: Arc::downgrade(&self.channels),
        });

        if let Some(previous) = self.channels.insert(name.to_string(), channel.clone()) {
            previous.cancel.cancel();
            tracing::debug!(
                channel = %name,
                generation = previous.generation,
                "progress channel superseded"
            );
        }
        tracing::debug!(channel = %name, generation = channel.generation, keep_alive, "progress channel opened");
        channel
    }

    /// Open on behalf of one client; output is delivered to that client only.
    pub fn open_for(&self, name: &str, fd: &str, keep_alive: bool) -> Arc<ProgressChannel> {
        let channel = self.open(name, keep_alive);
        channel.subscribe(fd);
        channel
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProgressChannel>> {
        self.channels.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<ProgressChannel>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    /// A client asked to stop `name`. Keep-alive channels only lose that
    /// subscriber; any other channel is closed outright.
    pub fn close_requested(&self, name: &str, fd: &str) {
        let Some(channel) = self.get(name) else {
            return;
        };
        if channel.keep_alive() {
            channel.close_by_client(fd);
        } else {
            tracing::info!(channel = %name, fd = %fd, "progress channel closed by client");
            channel.close();
        }
    }

    /// A client went away: release its interest in every transient channel.
    pub fn release_client(&self, fd: &str) {
        for channel in self.snapshot() {
            if !channel.keep_alive() {
                channel.close_by_client(fd);
            }
        }
    }

    /// Close every channel not marked keep-alive. Returns how many were closed.
    pub fn close_transient(&self) -> usize {
        let mut closed = 0;
        for channel in self.snapshot() {
            if !channel.keep_alive() {
                channel.close();
                closed += 1;
            }
        }
        closed
    }

    pub fn close_all(&self) {
        for channel in self.snapshot() {
            channel.close();
        }
    }
}
