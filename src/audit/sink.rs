//! Batched audit sink
//!
//! `append` only pushes onto an in-memory batch. A ticker drains the batch and
//! hands it to the store in one write, outside the lock. Failed writes are logged
//! and the batch is dropped: audit loss never affects the live system.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::AuditStore;
use crate::events::{DaemonEvent, NormalizedEvent};

pub struct AuditSink {
    batch: Mutex<Vec<NormalizedEvent>>,
    store: Arc<dyn AuditStore>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            batch: Mutex::new(Vec::new()),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NormalizedEvent>> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, event: NormalizedEvent) {
        self.lock().push(event);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drain the batch and write it. Returns how many events were handed to the store.
    pub async fn flush(&self) -> usize {
        let snapshot = std::mem::take(&mut *self.lock());
        if snapshot.is_empty() {
            return 0;
        }

        let count = snapshot.len();
        tracing::debug!(count, "audit flush");
        if let Err(e) = self.store.write_batch(snapshot).await {
            tracing::error!(count, "audit write failed, batch dropped: {}", e);
        }
        count
    }

    /// Flush every `interval` until `shutdown` fires, then flush once more.
    pub fn start(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush().await;
                    }
                }
            }
            let count = self.flush().await;
            tracing::info!(count, "audit sink stopped");
        })
    }

    /// Append every normalized event seen on the daemon feed. Connectivity
    /// notifications are not audited.
    pub fn follow(
        self: Arc<Self>,
        mut feed: broadcast::Receiver<DaemonEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = feed.recv() => event,
                };
                match event {
                    Ok(DaemonEvent::Message(event)) => self.append(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "audit relay fell behind, events not recorded");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
