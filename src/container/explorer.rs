//! On-demand file explorer helper container.
//!
//! The explorer is started when a client browses a container's filesystem and is
//! only useful while someone is connected, so it is registered as an
//! [`IdleResource`] and torn down once the last client leaves.

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::errors::Error as BollardError;
use bollard::Docker;
use std::collections::HashMap;
use std::sync::Arc;

use crate::monitor::WatcherRegistry;
use crate::websocket::IdleResource;

pub const DEFAULT_EXPLORER_CONTAINER: &str = "relayd-plugin-explorer";

/// Containers labelled `false` here are left running.
pub const LABEL_AUTO_REMOVE: &str = "com.relayd.container.auto_remove";

pub struct ExplorerSidecar {
    watchers: Arc<WatcherRegistry>,
    env: String,
    container: String,
}

impl ExplorerSidecar {
    pub fn new(watchers: Arc<WatcherRegistry>, env: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            watchers,
            env: env.into(),
            container: container.into(),
        }
    }

    async fn remove(&self, docker: &Docker) -> Result<(), String> {
        let details = match docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.to_string()),
        };

        let labels = details.config.as_ref().and_then(|config| config.labels.as_ref());
        if !auto_remove(labels) {
            tracing::debug!(container = %self.container, "explorer marked persistent, kept");
            return Ok(());
        }

        let running = details
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if running {
            docker
                .stop_container(&self.container, None::<StopContainerOptions>)
                .await
                .map_err(|e| e.to_string())?;
        }
        docker
            .remove_container(
                &self.container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(container = %self.container, env = %self.env, "explorer container removed");
        Ok(())
    }
}

fn auto_remove(labels: Option<&HashMap<String, String>>) -> bool {
    labels
        .and_then(|labels| labels.get(LABEL_AUTO_REMOVE))
        .map_or(true, |value| value != "false")
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(e, BollardError::DockerResponseServerError { status_code: 404, .. })
}

#[async_trait]
impl IdleResource for ExplorerSidecar {
    fn name(&self) -> &str {
        &self.container
    }

    async fn release(&self) -> Result<(), String> {
        let session = self.watchers.connect(&self.env).await.map_err(|e| e.to_string())?;
        let Some(docker) = session.docker() else {
            session.close().await;
            return Ok(());
        };

        let result = self.remove(&docker).await;

        session.close().await;
        result
    }
}
