//! Image routes. Pulls run in the background and report through a progress channel.

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::image::{open_pull, pull_image};
use crate::monitor::WatcherRegistry;
use crate::websocket::protocol::image_pull_channel;
use crate::websocket::ProgressRegistry;

#[derive(Clone)]
pub struct ImageState {
    pub watchers: Arc<WatcherRegistry>,
    pub progress: Arc<ProgressRegistry>,
}

#[derive(Deserialize)]
struct PullRequest {
    env: String,
    tag: String,
    /// Websocket client that asked for the pull; output is delivered to it only
    #[serde(default)]
    fd: Option<String>,
}

#[derive(Serialize)]
struct PullResponse {
    channel: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn image_router(watchers: Arc<WatcherRegistry>, progress: Arc<ProgressRegistry>) -> Router {
    let state = ImageState { watchers, progress };

    Router::new()
        .route("/api/images/pull", post(pull))
        .with_state(state)
}

async fn pull(
    State(state): State<ImageState>,
    Json(payload): Json<PullRequest>,
) -> Result<(StatusCode, Json<PullResponse>), (StatusCode, Json<ErrorResponse>)> {
    let tag = payload.tag.trim().to_string();
    if tag.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "tag is required".to_string(),
            }),
        ));
    }
    if !state.watchers.contains(&payload.env) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("environment {} is not watched", payload.env),
            }),
        ));
    }

    let name = image_pull_channel(&tag);
    let watchers = state.watchers.clone();
    let progress = state.progress.clone();
    let env = payload.env;
    let fd = payload.fd.filter(|fd| !fd.is_empty());

    tokio::spawn(async move {
        let session = match watchers.connect(&env).await {
            Ok(session) => session,
            Err(e) => {
                open_pull(&progress, &tag, fd.as_deref()).fail(&e.to_string());
                return;
            }
        };
        match session.docker() {
            Some(docker) => {
                if let Err(e) = pull_image(&progress, &docker, &tag, fd.as_deref()).await {
                    tracing::debug!(env = %env, "pull of {} ended with error: {}", tag, e);
                }
            }
            None => open_pull(&progress, &tag, fd.as_deref()).fail("daemon session has no API client"),
        }
        session.close().await;
    });

    Ok((StatusCode::ACCEPTED, Json(PullResponse { channel: name })))
}
