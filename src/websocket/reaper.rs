//! Idle cleanup once the last client disconnects.
//!
//! The hub only reports counts. What "idle" means lives here: transient progress
//! channels are closed and helper resources that exist to serve interactive
//! sessions are released.

use async_trait::async_trait;
use std::sync::Arc;

use super::hub::ClientCountObserver;
use super::progress::ProgressRegistry;

/// A resource that only makes sense while someone is connected.
#[async_trait]
pub trait IdleResource: Send + Sync {
    fn name(&self) -> &str;

    async fn release(&self) -> Result<(), String>;
}

pub struct IdleResourceReaper {
    progress: Arc<ProgressRegistry>,
    resources: Vec<Arc<dyn IdleResource>>,
}

impl IdleResourceReaper {
    pub fn new(progress: Arc<ProgressRegistry>) -> Self {
        Self {
            progress,
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: Arc<dyn IdleResource>) -> Self {
        self.resources.push(resource);
        self
    }
}

impl ClientCountObserver for IdleResourceReaper {
    fn client_count_changed(&self, total: usize) {
        if total != 0 {
            return;
        }
        let closed = self.progress.close_transient();
        tracing::info!(closed, "no clients left, closed transient progress channels");

        if self.resources.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available, idle resources not released");
            return;
        };
        for resource in &self.resources {
            let resource = resource.clone();
            runtime.spawn(async move {
                match resource.release().await {
                    Ok(()) => tracing::debug!(resource = resource.name(), "idle resource released"),
                    Err(e) => tracing::warn!(resource = resource.name(), "release failed: {}", e),
                }
            });
        }
    }
}
