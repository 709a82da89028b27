//! Audit storage backends.

use async_trait::async_trait;
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::events::NormalizedEvent;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("audit task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one batch in a single write.
    async fn write_batch(&self, events: Vec<NormalizedEvent>) -> Result<(), AuditError>;
}

/// Events keyed by big-endian `time_nano` followed by a sled-generated id, so the
/// tree iterates chronologically and same-nanosecond events never collide, even
/// across restarts.
pub struct SledAuditStore {
    db: Arc<Db>,
}

impl SledAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let db = sled::open(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key(&self, event: &NormalizedEvent) -> Result<[u8; 16], AuditError> {
        let mut key = [0u8; 16];
        // Shift into unsigned space so pre-epoch times still sort first.
        let time = (event.time_nano as u64) ^ (1 << 63);
        key[..8].copy_from_slice(&time.to_be_bytes());
        key[8..].copy_from_slice(&self.db.generate_id()?.to_be_bytes());
        Ok(key)
    }

    /// Newest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<NormalizedEvent>, AuditError> {
        let mut events = Vec::with_capacity(limit.min(256));
        for entry in self.db.iter().rev().take(limit) {
            let (_, value) = entry?;
            events.push(serde_json::from_slice(&value)?);
        }
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }
}

#[async_trait]
impl AuditStore for SledAuditStore {
    async fn write_batch(&self, events: Vec<NormalizedEvent>) -> Result<(), AuditError> {
        let mut batch = sled::Batch::default();
        for event in &events {
            batch.insert(&self.key(event)?[..], serde_json::to_vec(event)?);
        }

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), AuditError> {
            db.apply_batch(batch)?;
            db.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| AuditError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(time_nano: i64, message: &str) -> NormalizedEvent {
        NormalizedEvent {
            env: "local".to_string(),
            action: "container/start".to_string(),
            attributes: BTreeMap::new(),
            time_nano,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_batch_is_read_back_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledAuditStore::open(dir.path().join("audit.db")).unwrap();

        store
            .write_batch(vec![event(300, "c"), event(100, "a"), event(200, "b")])
            .await
            .unwrap();

        assert_eq!(store.len(), 3);
        let recent: Vec<String> = store.recent(2).unwrap().into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_same_timestamp_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledAuditStore::open(dir.path().join("audit.db")).unwrap();

        store.write_batch(vec![event(1, "x"), event(1, "y")]).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_same_timestamp_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let time_nano = 1_700_000_000_000_000_000;

        {
            let store = SledAuditStore::open(&path).unwrap();
            store.write_batch(vec![event(time_nano, "first-run")]).await.unwrap();
        }

        let store = SledAuditStore::open(&path).unwrap();
        store.write_batch(vec![event(time_nano, "second-run")]).await.unwrap();

        assert_eq!(store.len(), 2);
        let mut messages: Vec<String> = store.recent(10).unwrap().into_iter().map(|e| e.message).collect();
        messages.sort();
        assert_eq!(messages, vec!["first-run", "second-run"]);
    }
}
